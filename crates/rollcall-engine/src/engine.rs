use crate::config::Config;
use crate::store::{self, AttendanceRecord, MarkOutcome, Store, StoreError, TemplateRecord};
use chrono::NaiveDate;
use rollcall_core::detector::DetectorError;
use rollcall_core::{
    DecodeError, DetectionResult, EncodeError, Encoding, Enrollment, FaceDetector, FacePipeline, FeatureEncoder,
    MatchError, MatchResult, MatchStage, Matcher, MatchingOrchestrator, PipelineError,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
    #[error("match error: {0}")]
    Match(#[from] MatchError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("pipeline setup failed: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("detector setup failed: {0}")]
    Detector(#[from] DetectorError),
    #[error("no enrolled templates")]
    EmptyGallery,
    #[error("face did not match (similarity {similarity:.3})")]
    NoMatch {
        identity: Option<String>,
        similarity: f64,
    },
    #[error("spawning engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Result of an enrollment.
#[derive(Debug, Clone)]
pub struct EnrollResult {
    pub record: TemplateRecord,
    pub encoding: Encoding,
}

/// Result of a successful attendance mark attempt.
#[derive(Debug, Clone)]
pub struct AttendanceResult {
    pub outcome: MarkOutcome,
    pub similarity: f64,
}

/// Messages sent from async callers to the engine thread.
enum EngineRequest {
    Detect {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<DetectionResult, EngineError>>,
    },
    Encode {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Encoding, EngineError>>,
    },
    Enroll {
        identity: String,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<EnrollResult, EngineError>>,
    },
    Verify {
        identity: String,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<MatchResult, EngineError>>,
    },
    Search {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<MatchResult, EngineError>>,
    },
    MarkAttendance {
        image: Vec<u8>,
        identity: Option<String>,
        date: NaiveDate,
        reply: oneshot::Sender<Result<AttendanceResult, EngineError>>,
    },
    ListTemplates {
        reply: oneshot::Sender<Result<Vec<TemplateRecord>, EngineError>>,
    },
    Attendance {
        date: NaiveDate,
        identity: Option<String>,
        reply: oneshot::Sender<Result<Vec<AttendanceRecord>, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(request(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Detect the largest face. "No face" is `Ok` with `face: None`.
    pub async fn detect(&self, image: Vec<u8>) -> Result<DetectionResult, EngineError> {
        self.call(|reply| EngineRequest::Detect { image, reply }).await
    }

    pub async fn encode(&self, image: Vec<u8>) -> Result<Encoding, EngineError> {
        self.call(|reply| EngineRequest::Encode { image, reply }).await
    }

    /// Encode with the quality gate and store the template for `identity`.
    pub async fn enroll(&self, identity: String, image: Vec<u8>) -> Result<EnrollResult, EngineError> {
        self.call(|reply| EngineRequest::Enroll {
            identity,
            image,
            reply,
        })
        .await
    }

    /// Compare a photo against `identity`'s enrolled template.
    pub async fn verify(&self, identity: String, image: Vec<u8>) -> Result<MatchResult, EngineError> {
        self.call(|reply| EngineRequest::Verify {
            identity,
            image,
            reply,
        })
        .await
    }

    /// Find the best enrolled identity for a photo.
    pub async fn search(&self, image: Vec<u8>) -> Result<MatchResult, EngineError> {
        self.call(|reply| EngineRequest::Search { image, reply }).await
    }

    /// Identify (or verify, when `identity` is given) and record today's attendance.
    pub async fn mark_attendance(
        &self,
        image: Vec<u8>,
        identity: Option<String>,
    ) -> Result<AttendanceResult, EngineError> {
        self.mark_attendance_on(image, identity, store::today()).await
    }

    pub async fn mark_attendance_on(
        &self,
        image: Vec<u8>,
        identity: Option<String>,
        date: NaiveDate,
    ) -> Result<AttendanceResult, EngineError> {
        self.call(|reply| EngineRequest::MarkAttendance {
            image,
            identity,
            date,
            reply,
        })
        .await
    }

    pub async fn templates(&self) -> Result<Vec<TemplateRecord>, EngineError> {
        self.call(|reply| EngineRequest::ListTemplates { reply }).await
    }

    /// Ledger rows for `date`, restricted to `identity` when given.
    pub async fn attendance(
        &self,
        date: NaiveDate,
        identity: Option<String>,
    ) -> Result<Vec<AttendanceRecord>, EngineError> {
        self.call(|reply| EngineRequest::Attendance {
            date,
            identity,
            reply,
        })
        .await
    }
}

/// Pipeline, matcher, and store owned by the engine thread.
struct Engine {
    pipeline: FacePipeline,
    matcher: MatchingOrchestrator,
    store: Store,
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads the cascade and opens the database synchronously, so a bad model
/// path or unwritable database fails here rather than on the first request.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let store = Store::open(&config.db_path)?;
    spawn_with_store(config, store)
}

/// Spawn the engine over an already opened store.
///
/// The store decodes templates at the encoder's configured width.
pub fn spawn_with_store(config: &Config, store: Store) -> Result<EngineHandle, EngineError> {
    let pipeline = build_pipeline(config)?;
    let engine = Engine {
        pipeline,
        matcher: MatchingOrchestrator::new(config.match_threshold),
        store: store.with_template_len(config.encoder.template_len()),
    };

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(config.queue_depth.max(1));

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                engine.handle(req);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn build_pipeline(config: &Config) -> Result<FacePipeline, EngineError> {
    let Some(path) = &config.cascade_path else {
        tracing::info!(threshold = config.match_threshold, "using built-in cascade");
        return Ok(FacePipeline::with_configs(
            config.detector.clone(),
            config.encoder.clone(),
        )?);
    };
    let detector = FaceDetector::load(path, config.detector.clone())?;
    let encoder = FeatureEncoder::new(config.encoder.clone()).map_err(PipelineError::from)?;
    Ok(FacePipeline::new(detector, encoder))
}

impl Engine {
    fn handle(&self, req: EngineRequest) {
        // A dropped receiver means the caller went away; nothing to report.
        match req {
            EngineRequest::Detect { image, reply } => {
                let _ = reply.send(self.pipeline.detect(&image).map_err(Into::into));
            }
            EngineRequest::Encode { image, reply } => {
                let _ = reply.send(self.pipeline.encode(&image).map_err(Into::into));
            }
            EngineRequest::Enroll {
                identity,
                image,
                reply,
            } => {
                let _ = reply.send(self.run_enroll(&identity, &image));
            }
            EngineRequest::Verify {
                identity,
                image,
                reply,
            } => {
                let _ = reply.send(self.run_verify(&identity, &image));
            }
            EngineRequest::Search { image, reply } => {
                let _ = reply.send(self.run_search(&image));
            }
            EngineRequest::MarkAttendance {
                image,
                identity,
                date,
                reply,
            } => {
                let _ = reply.send(self.run_mark(&image, identity.as_deref(), date));
            }
            EngineRequest::ListTemplates { reply } => {
                let _ = reply.send(self.store.templates().map_err(Into::into));
            }
            EngineRequest::Attendance {
                date,
                identity,
                reply,
            } => {
                let _ = reply.send(
                    self.store
                        .attendance_on(date, identity.as_deref())
                        .map_err(Into::into),
                );
            }
        }
    }

    fn run_enroll(&self, identity: &str, image: &[u8]) -> Result<EnrollResult, EngineError> {
        let encoding = self.pipeline.enroll(image)?;
        let record = self.store.save_template(identity, &encoding)?;
        Ok(EnrollResult { record, encoding })
    }

    fn run_verify(&self, identity: &str, image: &[u8]) -> Result<MatchResult, EngineError> {
        let probe = self.pipeline.encode(image)?;
        let enrolled = self.store.template(identity)?;
        tracing::debug!(stage = ?MatchStage::Comparing, identity, "verify");
        let result = self.matcher.verify(&probe.template, enrolled.as_ref(), identity)?;
        log_outcome(&result);
        Ok(result)
    }

    fn run_search(&self, image: &[u8]) -> Result<MatchResult, EngineError> {
        let gallery = self.store.gallery()?;
        self.search_gallery(image, &gallery)
    }

    fn search_gallery(&self, image: &[u8], gallery: &[Enrollment]) -> Result<MatchResult, EngineError> {
        let probe = self.pipeline.encode(image)?;
        tracing::debug!(stage = ?MatchStage::Comparing, gallery = gallery.len(), "search");
        let result = self.matcher.search(&probe.template, gallery)?;
        log_outcome(&result);
        Ok(result)
    }

    fn run_mark(
        &self,
        image: &[u8],
        identity: Option<&str>,
        date: NaiveDate,
    ) -> Result<AttendanceResult, EngineError> {
        let result = match identity {
            Some(identity) => self.run_verify(identity, image)?,
            None => {
                let gallery = self.store.gallery()?;
                if gallery.is_empty() {
                    return Err(EngineError::EmptyGallery);
                }
                self.search_gallery(image, &gallery)?
            }
        };

        let Some(matched) = result.identity.filter(|_| result.matched) else {
            return Err(EngineError::NoMatch {
                identity: identity.map(str::to_string),
                similarity: result.similarity,
            });
        };

        let outcome = self.store.mark_attendance(&matched, date, result.similarity)?;
        Ok(AttendanceResult {
            outcome,
            similarity: result.similarity,
        })
    }
}

fn log_outcome(result: &MatchResult) {
    let stage = if result.matched {
        MatchStage::Matched
    } else {
        MatchStage::NotMatched
    };
    tracing::debug!(?stage, similarity = result.similarity, identity = ?result.identity, "match outcome");
}

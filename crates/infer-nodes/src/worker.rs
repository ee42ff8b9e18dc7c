//! Worker threads driving the post-processing stages.
//!
//! Each worker owns its stage instance, drains a bounded channel of
//! engine outputs and hands completed frames downstream. Construction
//! happens inside the thread and is reported through an init channel
//! so the caller can fail fast on a bad model description.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use crossbeam_channel::{Receiver, Sender};
use det_post::{FeatureProcDesc, ModelProcConfig, ProcessorRegistry};
use infer_data::{FrameResult, InferenceOutput};
use tracing::error;

use crate::config::NodeConfig;
use crate::detection::DetectionOutputStage;
use crate::feature::FeatureStage;
use crate::telemetry;
use crate::watchdog::{HealthComponent, PipelineHealth};

/// Spawn a detection worker thread that owns a stage instance.
///
/// The worker beats the health struct on every drained output and
/// stops when the running flag clears, shutdown is requested, or
/// either channel closes.
pub fn spawn_detection_worker(
    model_proc: Arc<ModelProcConfig>,
    config: Arc<NodeConfig>,
    output_rx: Receiver<InferenceOutput>,
    result_tx: Sender<FrameResult>,
    init_tx: Sender<std::result::Result<String, String>>,
    health: Arc<PipelineHealth>,
    running: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    worker_index: usize,
) -> io::Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread(format!("detection-worker-{worker_index}"), move || {
        let registry = ProcessorRegistry::with_builtins();
        let mut stage = match DetectionOutputStage::new(&model_proc, &config, &registry) {
            Ok(stage) => match init_tx.send(Ok(format!(
                "worker #{worker_index}: detection stage ready (threshold {:.2}, max roi {})",
                config.threshold, config.max_roi
            ))) {
                Ok(_) => stage,
                Err(_) => return,
            },
            Err(err) => {
                let _ = init_tx.send(Err(format!(
                    "worker #{worker_index}: failed to build detection stage: {err:#}"
                )));
                return;
            }
        };
        drop(init_tx);

        'outer: loop {
            if shutdown.load(Ordering::Relaxed) || !running.load(Ordering::Relaxed) {
                break;
            }

            let mut output = match output_rx.recv() {
                Ok(output) => output,
                Err(_) => break,
            };
            health.beat(HealthComponent::Detection);
            metrics::gauge!("infer_queue_depth", "queue" => "detection")
                .set(output_rx.len() as f64);

            for frame in stage.handle_output(&mut output) {
                if result_tx.send(frame).is_err() {
                    error!("Result channel closed, stopping detection worker");
                    running.store(false, Ordering::SeqCst);
                    break 'outer;
                }
            }
        }
    })
}

/// Spawn a feature worker thread; same lifecycle as the detection
/// worker with the feature stage inside.
pub fn spawn_feature_worker(
    feature_proc: Arc<Vec<FeatureProcDesc>>,
    output_rx: Receiver<InferenceOutput>,
    result_tx: Sender<FrameResult>,
    init_tx: Sender<std::result::Result<String, String>>,
    health: Arc<PipelineHealth>,
    running: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    worker_index: usize,
) -> io::Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread(format!("feature-worker-{worker_index}"), move || {
        let mut stage = match FeatureStage::new(&feature_proc) {
            Ok(stage) => match init_tx.send(Ok(format!(
                "worker #{worker_index}: feature stage ready ({} encoders)",
                stage.encoder_count()
            ))) {
                Ok(_) => stage,
                Err(_) => return,
            },
            Err(err) => {
                let _ = init_tx.send(Err(format!(
                    "worker #{worker_index}: failed to build feature stage: {err:#}"
                )));
                return;
            }
        };
        drop(init_tx);

        'outer: loop {
            if shutdown.load(Ordering::Relaxed) || !running.load(Ordering::Relaxed) {
                break;
            }

            let mut output = match output_rx.recv() {
                Ok(output) => output,
                Err(_) => break,
            };
            health.beat(HealthComponent::Feature);
            metrics::gauge!("infer_queue_depth", "queue" => "feature")
                .set(output_rx.len() as f64);

            for frame in stage.handle_output(&mut output) {
                if result_tx.send(frame).is_err() {
                    error!("Result channel closed, stopping feature worker");
                    running.store(false, Ordering::SeqCst);
                    break 'outer;
                }
            }
        }
    })
}

// Copyright © 2024, Embark Studios, all rights reserved.
// Created: 26 February 2024

use super::indent_by;
use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::Rng;
use serde::Serialize;
use shoal::core::prelude::{ModelSignature, NativeModel, Tensor, TensorData, TensorMap};
use shoal::core::tensor::element_count;
use shoal::dispatch::{DispatchMode, PoolConfig, ThreadPool, WorkerStats};
use shoal::onnx::OnnxLoader;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

/// Serve a model from a worker pool and drive requests through it.
#[derive(Parser, Debug)]
#[clap()]
pub(crate) struct Args {
    /// The ONNX model file.
    file: PathBuf,

    /// A TOML file with pool settings. Flags override its values.
    #[clap(long)]
    config: Option<PathBuf>,

    /// Number of workers. Defaults to one per device.
    #[clap(short, long)]
    workers: Option<usize>,

    /// Maximum number of requests per batch.
    #[clap(long)]
    batch_limit: Option<usize>,

    /// Queue capacity, in batches.
    #[clap(long)]
    queue_limit: Option<usize>,

    /// Dispatch mode: sequential or batched.
    #[clap(long)]
    mode: Option<DispatchMode>,

    /// Give up on a full queue after this many milliseconds.
    #[clap(long)]
    enqueue_timeout_ms: Option<u64>,

    /// Total number of requests to send.
    #[clap(short, long, default_value = "100")]
    requests: usize,

    /// Number of threads sending requests.
    #[clap(short, long, default_value = "4")]
    concurrency: usize,

    /// A JSON file with a list of requests, used round-robin instead of
    /// random inputs.
    #[clap(long)]
    inputs: Option<PathBuf>,

    #[clap(long)]
    print_output: bool,

    /// Print the report as JSON.
    #[clap(long)]
    json: bool,
}

fn pool_config(config: &Args) -> Result<PoolConfig> {
    let mut pool = match &config.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed reading {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("invalid pool config {}", path.display()))?
        }
        None => PoolConfig::default(),
    };

    if let Some(workers) = config.workers {
        pool = pool.with_workers(workers);
    }

    if let Some(batch_limit) = config.batch_limit {
        pool = pool.with_batch_limit(batch_limit);
    }

    if let Some(queue_limit) = config.queue_limit {
        pool = pool.with_queue_limit(queue_limit);
    }

    if let Some(mode) = config.mode {
        pool = pool.with_mode(mode);
    }

    if let Some(timeout) = config.enqueue_timeout_ms {
        pool = pool.with_enqueue_timeout(Some(Duration::from_millis(timeout)));
    }

    pool.validate()?;
    Ok(pool)
}

fn load_inputs(path: &Path) -> Result<Vec<TensorMap>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))?;
    let inputs: Vec<TensorMap> = serde_json::from_str(&text)
        .with_context(|| format!("invalid requests in {}", path.display()))?;

    if inputs.is_empty() {
        bail!("{} holds no requests", path.display());
    }

    Ok(inputs)
}

/// A request filled with random values. Dynamic dimensions are set to 1.
fn random_request(signature: &ModelSignature, rng: &mut impl Rng) -> Result<TensorMap> {
    let mut request = TensorMap::new();

    for spec in &signature.inputs {
        let shape = spec.concrete_shape(1);
        let len = element_count(&shape)?;
        let element_type = spec.element_type;

        let data = TensorData::from_fn(element_type, len, |_| {
            if element_type.is_float() {
                rng.gen_range(-1.0..1.0)
            } else if element_type == shoal::core::prelude::ElementType::Bool {
                rng.gen_range(0..2) as f64
            } else {
                rng.gen_range(0..10) as f64
            }
        });

        request.insert(spec.name.clone(), Tensor::new(shape, data)?);
    }

    Ok(request)
}

fn mean(data: &[f64]) -> Option<f64> {
    let sum = data.iter().sum::<f64>();
    let count = data.len();

    match count {
        positive if positive > 0 => Some(sum / count as f64),
        _ => None,
    }
}

fn std_deviation(data: &[f64]) -> Option<f64> {
    let data_mean = mean(data)?;
    let count = data.len();

    let variance = data
        .iter()
        .map(|value| {
            let diff = data_mean - value;

            diff * diff
        })
        .sum::<f64>()
        / count as f64;

    Some(variance.sqrt())
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

#[derive(Serialize)]
struct WorkerRecord {
    index: usize,
    device: String,
    state: String,
    processed_batches: u64,
    processed_requests: u64,
    failed_requests: u64,
    mean_batch_ms: Option<f64>,
    batch_std_dev_ms: Option<f64>,
    max_batch_ms: Option<f64>,
    mean_ms_by_batch_size: Vec<(usize, f64)>,
}

impl From<WorkerStats> for WorkerRecord {
    fn from(stats: WorkerStats) -> Self {
        Self {
            index: stats.index,
            device: stats.device.to_string(),
            state: stats.state.to_string(),
            processed_batches: stats.processed_batches,
            processed_requests: stats.processed_requests,
            failed_requests: stats.failed_requests,
            mean_batch_ms: stats.mean_latency.map(millis),
            batch_std_dev_ms: stats.latency_std_dev.map(millis),
            max_batch_ms: stats.max_latency.map(millis),
            mean_ms_by_batch_size: stats
                .latency_by_batch_size
                .into_iter()
                .map(|(size, mean)| (size, millis(mean)))
                .collect(),
        }
    }
}

#[derive(Serialize)]
struct Report {
    requests: usize,
    failed: usize,
    concurrency: usize,
    total_ms: f64,
    requests_per_second: f64,
    mean_latency_ms: Option<f64>,
    latency_std_dev_ms: Option<f64>,
    workers: Vec<WorkerRecord>,
}

struct Outcome {
    index: usize,
    latency: Duration,
    result: Result<TensorMap, String>,
}

fn drive(
    pool: &ThreadPool,
    signature: &ModelSignature,
    inputs: Option<&[TensorMap]>,
    requests: usize,
    concurrency: usize,
) -> Result<Vec<Outcome>> {
    let concurrency = concurrency.clamp(1, requests.max(1));

    thread::scope(|scope| {
        let senders: Vec<_> = (0..concurrency)
            .map(|sender| {
                scope.spawn(move || -> Result<Vec<Outcome>> {
                    let mut rng = rand::thread_rng();
                    let mut outcomes = vec![];

                    for index in (sender..requests).step_by(concurrency) {
                        let request = match inputs {
                            Some(inputs) => inputs[index % inputs.len()].clone(),
                            None => random_request(signature, &mut rng)?,
                        };

                        let start = Instant::now();
                        let result = pool.infer(request).map_err(|e| e.to_string());
                        outcomes.push(Outcome {
                            index,
                            latency: start.elapsed(),
                            result,
                        });
                    }

                    Ok(outcomes)
                })
            })
            .collect();

        let mut outcomes = vec![];
        for sender in senders {
            match sender.join() {
                Ok(sent) => outcomes.extend(sent?),
                Err(_) => bail!("request thread panicked"),
            }
        }

        outcomes.sort_by_key(|outcome| outcome.index);
        Ok(outcomes)
    })
}

pub(super) fn run(config: Args) -> Result<()> {
    let pool_config = pool_config(&config)?;
    let loader = OnnxLoader::from_path(&config.file)?;
    let signature = loader.load()?.signature()?;

    let inputs = config.inputs.as_deref().map(load_inputs).transpose()?;

    let pool = ThreadPool::new(Arc::new(loader), pool_config)?;

    let start = Instant::now();
    let outcomes = drive(
        &pool,
        &signature,
        inputs.as_deref(),
        config.requests,
        config.concurrency,
    )?;
    let elapsed = start.elapsed();

    pool.shutdown();

    let latencies: Vec<f64> = outcomes.iter().map(|o| millis(o.latency)).collect();
    let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
    if let Some(error) = outcomes.iter().find_map(|o| o.result.as_ref().err()) {
        log::warn!("{} of {} requests failed, first error: {}", failed, outcomes.len(), error);
    }

    if config.print_output {
        for outcome in &outcomes {
            let formatted = match &outcome.result {
                Ok(outputs) => serde_json::to_string_pretty(outputs)?,
                Err(error) => format!("error: {}", error),
            };
            println!("Request {}:\n{}", outcome.index, indent_by(formatted, 4));
        }
    }

    let report = Report {
        requests: outcomes.len(),
        failed,
        concurrency: config.concurrency,
        total_ms: millis(elapsed),
        requests_per_second: outcomes.len() as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        mean_latency_ms: mean(&latencies),
        latency_std_dev_ms: std_deviation(&latencies),
        workers: pool.worker_stats().into_iter().map(WorkerRecord::from).collect(),
    };

    if config.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "Ran {} requests ({} failed) in {:.2} ms, {:.1} requests/s",
        report.requests, report.failed, report.total_ms, report.requests_per_second
    );

    if let (Some(mean), Some(std_dev)) = (report.mean_latency_ms, report.latency_std_dev_ms) {
        println!("Latency: {:.3} ms ± {:.3} ms", mean, std_dev);
    }

    println!("\nWorkers:");
    for worker in &report.workers {
        println!(
            "\t{:3} {:8} {:9} batches {:6} requests {:6} failed {:4} mean batch {}",
            worker.index,
            worker.device,
            worker.state,
            worker.processed_batches,
            worker.processed_requests,
            worker.failed_requests,
            worker
                .mean_batch_ms
                .map(|ms| format!("{:.3} ms", ms))
                .unwrap_or_else(|| "-".to_owned()),
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{pool_config, random_request, Args};
    use clap::Parser;
    use shoal::core::prelude::{ElementType, ModelSignature, TensorSpec};
    use shoal::dispatch::DispatchMode;
    use std::{io::Write, time::Duration};

    #[test]
    fn flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "workers = 2\nbatch_limit = 8\nmode = \"sequential\"\nenqueue_timeout_ms = 100"
        )
        .unwrap();

        let args = Args::parse_from([
            "run",
            "model.onnx",
            "--config",
            file.path().to_str().unwrap(),
            "--batch-limit",
            "16",
        ]);

        let config = pool_config(&args).unwrap();
        assert_eq!(config.workers, Some(2));
        assert_eq!(config.batch_limit, 16);
        assert_eq!(config.mode, DispatchMode::Sequential);
        assert_eq!(config.enqueue_timeout, Some(Duration::from_millis(100)));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let args = Args::parse_from(["run", "model.onnx", "--queue-limit", "0"]);
        assert!(pool_config(&args).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "batch_size = 3").unwrap();
        let args = Args::parse_from([
            "run",
            "model.onnx",
            "--config",
            file.path().to_str().unwrap(),
        ]);
        assert!(pool_config(&args).is_err());
    }

    #[test]
    fn random_requests_match_signature() {
        let signature = ModelSignature::new(
            vec![
                TensorSpec::new("obs", ElementType::F32, vec![None, Some(3)]),
                TensorSpec::fixed("mask", ElementType::Bool, &[2]),
            ],
            vec![],
        );

        let request = random_request(&signature, &mut rand::thread_rng()).unwrap();
        assert!(signature.validate_request(&request).is_ok());
        assert_eq!(request["obs"].shape(), &[1, 3]);
    }

    #[test]
    fn oversized_inputs_are_refused() {
        let signature = ModelSignature::new(
            vec![TensorSpec::fixed("obs", ElementType::F32, &[usize::MAX, 2])],
            vec![],
        );

        assert!(random_request(&signature, &mut rand::thread_rng()).is_err());
    }
}

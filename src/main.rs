use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::time::{sleep, Duration};

use routerdash::api::{ExperimentApi, HttpApi};
use routerdash::config::Config;
use routerdash::hub::ExperimentHub;
use routerdash::logging::{log, obj, v_str, Domain, Level};
use routerdash::model::{ExperimentConfig, ExperimentId, ExperimentStatus, LogKind};

fn usage() -> ! {
    eprintln!("usage: routerdash <experiment_id> [--watch] [--limit N] [--judge-model M] [--threshold T]");
    eprintln!("experiment ids:");
    for id in ExperimentId::ALL {
        eprintln!("  {}", id);
    }
    std::process::exit(2);
}

struct CliArgs {
    id: ExperimentId,
    watch: bool,
    config: ExperimentConfig,
}

fn parse_args() -> Result<CliArgs> {
    let mut args = std::env::args().skip(1);
    let id: ExperimentId = match args.next() {
        Some(raw) => raw.parse()?,
        None => usage(),
    };
    let mut watch = false;
    let mut config = ExperimentConfig::default();
    while let Some(flag) = args.next() {
        match flag.as_str() {
            "--watch" => watch = true,
            "--limit" => {
                config.limit = Some(
                    args.next()
                        .ok_or_else(|| anyhow!("--limit needs a value"))?
                        .parse()?,
                )
            }
            "--judge-model" => {
                config.judge_model =
                    Some(args.next().ok_or_else(|| anyhow!("--judge-model needs a value"))?)
            }
            "--threshold" => {
                config.threshold = Some(
                    args.next()
                        .ok_or_else(|| anyhow!("--threshold needs a value"))?
                        .parse()?,
                )
            }
            other => return Err(anyhow!("unknown flag: {}", other)),
        }
    }
    Ok(CliArgs { id, watch, config })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = parse_args()?;
    let cfg = Config::from_env();
    let api: Arc<dyn ExperimentApi> = Arc::new(HttpApi::new(&cfg)?);

    if !api.health().await {
        log(
            Level::Warn,
            Domain::System,
            "backend_unreachable",
            obj(&[("api_base", v_str(&cfg.api_base))]),
        );
    }

    let mut hub = ExperimentHub::new(api, cfg);
    let runner = hub.runner(cli.id);

    if cli.watch {
        runner.refresh().await;
        if runner.state().status == ExperimentStatus::Idle {
            println!("{}: idle, nothing to watch", cli.id);
            return Ok(());
        }
    } else {
        runner.run(&cli.config).await;
    }

    let mut cursor = 0u64;
    let mut error_lines = 0usize;
    let outcome = loop {
        let (lines, next) = runner.logs_since(cursor);
        cursor = next;
        for line in &lines {
            if LogKind::of(line) == LogKind::Error {
                error_lines += 1;
            }
            println!("{}", line);
        }

        let state = runner.state();
        if state.status.is_terminal() {
            // One last drain for lines that landed with the terminal poll.
            let (tail, _) = runner.logs_since(cursor);
            for line in &tail {
                if LogKind::of(line) == LogKind::Error {
                    error_lines += 1;
                }
                println!("{}", line);
            }
            break state;
        }
        sleep(Duration::from_millis(250)).await;
    };

    hub.teardown_all();

    if error_lines > 0 {
        eprintln!("({} error lines in output)", error_lines);
    }
    match outcome.status {
        ExperimentStatus::Completed => {
            if let Some(results) = &outcome.results {
                println!("{}", serde_json::to_string_pretty(results)?);
            }
            println!("{}: completed", cli.id);
            Ok(())
        }
        _ => Err(anyhow!(
            "{}: {}",
            cli.id,
            outcome.error.as_deref().unwrap_or("failed without error detail")
        )),
    }
}

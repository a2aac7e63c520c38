//! Consumer executable with a handful of demo tasks.
//!
//! ```text
//! scrooge_consumer -w 4 -k greenlet -v
//! scrooge_consumer --config scrooge.json -k process
//! ```

use clap::Parser;
use scrooge::cli::{ConsumerArgs, run_consumer};
use scrooge::crontab::Crontab;
use scrooge::logging::init_logging;
use scrooge::prelude::*;
use std::process::ExitCode;
use std::time::Duration;

fn register_demo_tasks(scrooge: &Scrooge) -> ScroogeResult<()> {
    scrooge.task(TaskOptions::new("add"), |(a, b): (i64, i64)| async move {
        Ok::<_, TaskError>(a + b)
    })?;

    scrooge.task(TaskOptions::new("sleep"), |seconds: f64| async move {
        tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
        Ok::<_, TaskError>(seconds)
    })?;

    scrooge.task(
        TaskOptions::new("fail").retries(2).retry_delay(1),
        |message: String| async move { Err::<(), _>(TaskError::failed(message)) },
    )?;

    let lock = scrooge.lock_task("report");
    scrooge.task(TaskOptions::new("report"), move |rows: u64| {
        let lock = lock.clone();
        async move {
            lock.run(async {
                tokio::time::sleep(Duration::from_millis(rows)).await;
                Ok::<_, TaskError>(format!("{} rows", rows))
            })
            .await
        }
    })?;

    scrooge.periodic_task(
        Crontab::every_minute(),
        TaskOptions::new("heartbeat"),
        || async {
            tracing::info!("💓 heartbeat");
            Ok::<_, TaskError>(())
        },
    )?;

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = ConsumerArgs::parse();

    let config = match args.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("scrooge_consumer: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("scrooge_consumer: {}", e);
        return ExitCode::FAILURE;
    }

    let scrooge = match Scrooge::from_config(&config).await {
        Ok(scrooge) => scrooge,
        Err(e) => {
            tracing::error!("Failed to open storage: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = register_demo_tasks(&scrooge) {
        tracing::error!("Failed to register tasks: {}", e);
        return ExitCode::FAILURE;
    }

    run_consumer(scrooge, &config).await
}

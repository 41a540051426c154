mod config;
mod logger;
mod middleware;
mod stats;
mod webrcon;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast;

use config::Args;
use middleware::pool::RedisPool;
use middleware::{DynamicQueueFanout, Processor, QueueFanout};
use stats::{MonitorFanout, StatsClient};
use webrcon::{RconClient, RconOptions};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = config::load_config(&args.config).context("Error loading config")?;
    logger::setup_logging(&config.logging, args.debug).context("Error setting up logging")?;

    if !config.enable_redis_queue && !config.enable_influx_stats {
        bail!("at least one of enable_redis_queue or enable_influx_stats must be enabled");
    }

    let password =
        config::load_rcon_password(&args.passfile).context("Unable to read rcon passfile")?;
    let tag = args
        .tag
        .clone()
        .unwrap_or_else(|| format!("{}:{}", args.hostname, args.port));
    log::info!("Starting rustcon, tag {}", tag);

    let rcon = RconClient::new(
        &args.hostname,
        args.port,
        &password,
        RconOptions {
            onconnect_delay: config.onconnect_delay,
            call_onmessage_on_invoke: config.call_onmessage_on_invoke,
            ignore_empty_rcon_messages: config.ignore_empty_rcon_messages,
        },
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut workers = Vec::new();

    if config.enable_redis_queue {
        let pool = Arc::new(
            RedisPool::new(
                &config.redis.hostname,
                config.redis.port,
                config.redis.db,
                &config.redis.password,
            )
            .context("Error building Redis pool")?,
        );
        let mut processor = Processor::new(
            &tag,
            Arc::new(rcon.clone()),
            pool.clone(),
            config.callback_queue_key.as_deref(),
            config.callback_expire,
        );

        if let Err(e) = processor.ping().await {
            log::error!("Redis ping failed: {}", e);
        }

        for callback in &config.interval_callbacks {
            if callback.interval > 0 {
                processor.add_interval_callback(
                    &callback.command,
                    callback.interval,
                    &callback.storage_key,
                );
            } else if !callback.run_on_connect {
                log::warn!(
                    "{} callback has no interval and run_on_connect is false; it will never run",
                    callback.command
                );
            }
            if callback.run_on_connect {
                rcon.on_connect(
                    &callback.command,
                    processor.storage_callback(&callback.storage_key),
                );
            }
        }

        for suffix in &config.static_queues {
            rcon.on_message(Arc::new(QueueFanout::new(
                &config.queues_prefix,
                suffix,
                &tag,
                config.max_queue_size,
                pool.clone(),
            )));
        }

        if let Some(key) = &config.dynamic_queue_key {
            rcon.on_message(Arc::new(DynamicQueueFanout::new(
                key,
                &config.queues_prefix,
                &tag,
                config.max_queue_size,
                pool.clone(),
            )));
        }

        workers.push(tokio::spawn(
            Arc::new(processor).process(shutdown_tx.subscribe()),
        ));
    }

    if config.enable_influx_stats {
        let mut stats = StatsClient::new(&tag, rcon.clone(), &config.influx, args.test)
            .context("Error building stats client")?;

        for stat in &config.stats.invoked {
            if !stat.disabled {
                stats.register_invoked_stat(&stat.command, &stat.script, stat.interval);
            }
        }
        for stat in &config.stats.internal {
            if !stat.disabled {
                stats.register_internal_stat(&stat.script, stat.interval);
            }
        }
        for stat in &config.stats.monitored {
            if !stat.disabled {
                stats.register_monitored_stat(&stat.pattern, &stat.script);
            }
        }

        let stats = Arc::new(stats);
        rcon.on_message(Arc::new(MonitorFanout::new(stats.clone())));
        workers.push(tokio::spawn(stats.collect_stats(shutdown_tx.subscribe())));
    }

    workers.push(tokio::spawn(
        rcon.clone().maintain_connection(shutdown_tx.subscribe()),
    ));

    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Interrupt received, initiating shutdown");
        }
        _ = terminate_signal() => {
            log::info!("SIGTERM received, initiating shutdown");
        }
    }

    let _ = shutdown_tx.send(());
    for worker in workers {
        let _ = worker.await;
    }

    log::info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn terminate_signal() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(e) => {
            log::error!("Unable to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}

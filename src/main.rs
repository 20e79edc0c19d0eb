use anyhow::Result;
use chrono::{DateTime, Local};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ratelimit_gate::{
    config::load_settings, distributed::RedisLimiterFactory, CancellationToken, Dispatcher,
    LimiterKind, RateLimitError, RateLimiterRegistry, Target,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ratelimit_gate=debug,ratelimit_demo=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::var("CONFIG_PATH").ok();
    let mut settings = load_settings(config_path.as_deref())?;

    let kind = match std::env::var("DEMO_KIND").as_deref() {
        Ok("distributed") => LimiterKind::Distributed,
        _ => LimiterKind::Local,
    };
    if let Ok(url) = std::env::var("REDIS_URL") {
        settings.default_rule.store_url = Some(url);
    }

    let iterations = std::env::var("DEMO_ITERATIONS")
        .unwrap_or_else(|_| "500".to_string())
        .parse::<usize>()
        .unwrap_or(500);

    info!(
        "Running {} {} admissions, window {:?}, limit {}",
        iterations, kind, settings.default_rule.window, settings.default_rule.limit
    );

    let redis = Arc::new(RedisLimiterFactory::new((&settings.redis).into()));
    if kind == LimiterKind::Distributed {
        if let Some(address) = settings.default_rule.store_url.as_deref() {
            redis.health_check(address).await?;
            info!("Store at {} is healthy", address);
        }
    }

    let registry = RateLimiterRegistry::new(settings.default_rule.clone())
        .with_rules(settings.rules.clone())
        .with_factory(LimiterKind::Distributed, redis);
    let dispatcher = Dispatcher::new(Arc::new(registry));
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, cancelling pending admissions");
            trigger.cancel();
        }
    });

    let admitted: Arc<Mutex<Vec<DateTime<Local>>>> = Arc::default();
    for i in 0..iterations {
        let target = Target {
            kind,
            key: format!("demo_{}", i % 2),
            rule: None,
        };
        let admitted = admitted.clone();

        let result = dispatcher
            .enqueue(&target, &cancel, move || {
                let now = Local::now();
                println!("{}:{}", i, now.format("%m/%d/%Y %H:%M:%S%.3f"));
                if let Ok(mut times) = admitted.lock() {
                    times.push(now);
                }
            })
            .await;

        match result {
            Ok(()) => {}
            Err(RateLimitError::Cancelled) => break,
            Err(e) => {
                warn!("Admission failed: {}", e);
                return Err(e.into());
            }
        }
    }

    print_histogram(&admitted);
    Ok(())
}

/// Admissions per wall-clock second
fn print_histogram(admitted: &Mutex<Vec<DateTime<Local>>>) {
    let mut per_second: BTreeMap<String, usize> = BTreeMap::new();
    if let Ok(times) = admitted.lock() {
        for time in times.iter() {
            *per_second
                .entry(time.format("%Y-%m-%d %H:%M:%S").to_string())
                .or_default() += 1;
        }
    }

    for (second, count) in per_second {
        println!("{}:{}", second, count);
    }
}

use property_runner::{
    ElementRef, FnUnit, LeaderListener, LockConfig, Priority, PropertyMessage, UnitError,
    UnitRegistry, WorkerConfig, WorkerEngine,
};
use serde_json::json;
use std::time::Duration;
use tracing::info;

/// Single-process walkthrough: a text extractor guarded by a per-element lock, a derived
/// indexing queue, and a leader-only task reporting queue depth. Ctrl+C to exit.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut engine = WorkerEngine::builder()
        .lock_config(LockConfig::default())
        .build()
        .await?;
    let locks = engine.locks().clone();
    let extractor_locks = locks.clone();

    let extract = FnUnit::new("text-extractor", |ctx| ctx.property_name_is("raw"), move |ctx| {
        let locks = extractor_locks.clone();
        async move {
            let key = format!("element:{}", ctx.element.id);
            locks
                .run_locked(&key, || async {
                    let raw = ctx.property_value().and_then(|v| v.as_str()).unwrap_or_default();
                    let derived = ctx
                        .derive()
                        .property("", "text")
                        .value("text", json!(raw.to_uppercase()))
                        .to_item("text-index")?;
                    Ok::<_, UnitError>(vec![derived])
                })
                .await
        }
    });
    let index = FnUnit::new("indexer", |ctx| ctx.property_name_is("text"), |ctx| async move {
        info!(element = %ctx.element.id, text = ?ctx.property_value(), "Indexed");
        Ok::<_, UnitError>(Vec::new())
    });

    engine.add_runner(WorkerConfig::new("graph-property"), UnitRegistry::new().with(extract));
    engine.add_runner(WorkerConfig::new("text-index"), UnitRegistry::new().with(index));

    for (id, priority) in [("v1", Priority::Normal), ("v2", Priority::High), ("v3", Priority::Low)] {
        let message = PropertyMessage::for_element(ElementRef::vertex(id))
            .property("", "raw")
            .value("raw", json!(format!("content of {id}")))
            .priority(priority);
        engine.queue().push_item(message.to_item("graph-property")?).await?;
    }

    let queue = engine.queue().clone();
    let election = locks
        .start_leader_election(
            "queue-report",
            LeaderListener::task(move |cancel| {
                let queue = queue.clone();
                async move {
                    loop {
                        let pending = queue.size_of("graph-property").await.unwrap_or_default();
                        info!(pending, "Leader report");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                        }
                    }
                }
            }),
        )
        .await?;

    engine.start().await?;
    election.stop().await;
    Ok(())
}

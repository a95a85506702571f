use keel_engine::{Engine, EngineConfig, EventRecorder};
use tracing::info;

pub fn list(engine: &Engine, since: u64, limit: usize) -> anyhow::Result<()> {
    for event in EventRecorder::list(&engine.store, since, limit)? {
        println!("{:>6}  {}  {:<22} {}", event.seq, event.ts, event.kind, event.payload);
    }
    Ok(())
}

pub fn timeline(engine: &Engine, deployment: &str) -> anyhow::Result<()> {
    let changes = EventRecorder::deployment_timeline(&engine.store, deployment)?;
    if changes.is_empty() {
        anyhow::bail!("no recorded transitions for deployment {deployment}");
    }
    for change in changes {
        let from = change
            .old_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "(created)".to_string());
        println!("{:>6}  {}  {} -> {}", change.seq, change.ts, from, change.new_status);
        if let Some(error) = change.error {
            println!("        error: {error}");
        }
    }
    Ok(())
}

pub async fn reconcile(engine: &Engine, config: &EngineConfig, watch: bool) -> anyhow::Result<()> {
    if !watch {
        let failed = engine.reconciler.reconcile_once(config.stale_after())?;
        println!("✓ Reconciled {} stale deployment(s)", failed.len());
        let report = engine.reconciler.audit()?;
        for violation in &report.pointer_violations {
            println!(
                "! app {} points at {}: {}",
                violation.app_id, violation.release_id, violation.reason
            );
        }
        for mismatch in &report.log_mismatches {
            println!(
                "! deployment {} is {} but the log says {:?}",
                mismatch.deployment_id, mismatch.stored, mismatch.logged
            );
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let reconciler = engine.reconciler.clone();
    let interval = config.reconcile_interval();
    let stale_after = config.stale_after();
    let task =
        tokio::spawn(async move { reconciler.run(interval, stale_after, shutdown_rx).await });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    task.await?;
    Ok(())
}

use anyhow::Context;
use keel_engine::Engine;

use super::print_deployment;

pub fn deploy(engine: &Engine, app: &str, release: &str) -> anyhow::Result<()> {
    let app = engine.apps.get(app)?;
    let deployment = engine
        .deployments
        .deploy(&app.id, release)
        .with_context(|| format!("deploy of release {release} to {} failed", app.name))?;
    println!("✓ {} now runs release {}", app.name, deployment.to_release_id);
    print_deployment(&deployment);
    Ok(())
}

pub fn rollback(engine: &Engine, deployment: &str) -> anyhow::Result<()> {
    let deployment = engine.deployments.rollback(deployment)?;
    println!(
        "✓ Rolled back to release {}",
        deployment.from_release_id.as_deref().unwrap_or("-")
    );
    print_deployment(&deployment);
    Ok(())
}

pub fn list(engine: &Engine, app: &str) -> anyhow::Result<()> {
    let app = engine.apps.get(app)?;
    for deployment in engine.deployments.list_deployments(&app.id)? {
        print_deployment(&deployment);
    }
    Ok(())
}

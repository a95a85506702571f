use clap::Subcommand;
use keel_engine::Engine;

#[derive(Subcommand)]
pub enum AppAction {
    /// Register a new app
    Register {
        name: String,
        /// Source repository location
        #[arg(short, long)]
        repo: String,
    },
    /// List apps
    List,
    /// Remove an app with its releases, deployments and bindings
    Deregister { name: String },
}

pub fn run(engine: &Engine, action: AppAction) -> anyhow::Result<()> {
    match action {
        AppAction::Register { name, repo } => {
            let app = engine.apps.register(&name, &repo)?;
            println!("✓ Registered {} ({})", app.name, app.id);
        }
        AppAction::List => {
            for app in engine.apps.list()? {
                let current = engine
                    .current
                    .get_current(&app.id)?
                    .map(|r| r.id)
                    .unwrap_or_else(|| "-".to_string());
                println!("{:<24} current={}  repo={}", app.name, current, app.repo_path);
            }
        }
        AppAction::Deregister { name } => {
            let app = engine.apps.deregister(&name)?;
            println!("✓ Deregistered {}", app.name);
        }
    }
    Ok(())
}

use clap::Subcommand;
use keel_engine::Engine;
use serde_json::Value;

#[derive(Subcommand)]
pub enum AddonAction {
    /// Create an addon
    Create {
        name: String,
        /// Kind tag selecting the provisioning backend
        #[arg(short, long)]
        kind: String,
        /// Addon configuration as JSON
        #[arg(long)]
        config: Option<String>,
    },
    /// List addons
    List,
    /// Destroy an unbound addon
    Destroy { name: String },
    /// Bind an addon to an app
    Bind {
        #[arg(short, long)]
        app: String,
        #[arg(long)]
        addon: String,
        /// Binding override as JSON, e.g. '{"env":{"DATABASE_URL":"..."}}'
        #[arg(long)]
        config: Option<String>,
    },
    /// Unbind an addon from an app (no-op when not bound)
    Unbind {
        #[arg(short, long)]
        app: String,
        #[arg(long)]
        addon: String,
    },
}

fn parse_json(raw: Option<String>) -> anyhow::Result<Option<Value>> {
    raw.map(|text| serde_json::from_str(&text))
        .transpose()
        .map_err(|e| anyhow::anyhow!("invalid JSON config: {e}"))
}

pub fn run(engine: &Engine, action: AddonAction) -> anyhow::Result<()> {
    match action {
        AddonAction::Create { name, kind, config } => {
            let config = parse_json(config)?.unwrap_or(Value::Null);
            let addon = engine.addons.create_addon(&name, &kind, config)?;
            println!("✓ Created addon {} ({})", addon.name, addon.kind);
        }
        AddonAction::List => {
            for addon in engine.addons.list_addons()? {
                println!("{:<24} kind={}  created={}", addon.name, addon.kind, addon.created_at);
            }
        }
        AddonAction::Destroy { name } => {
            let addon = engine.addons.destroy_addon(&name)?;
            println!("✓ Destroyed addon {}", addon.name);
        }
        AddonAction::Bind { app, addon, config } => {
            let app = engine.apps.get(&app)?;
            let addon = engine.addons.get_addon(&addon)?;
            let binding = match parse_json(config)? {
                Some(config) => engine.addons.bind_with_config(&app.id, &addon.id, config)?,
                None => engine.addons.bind(&app.id, &addon.id)?,
            };
            println!("✓ Bound {} to {} ({})", addon.name, app.name, binding.id);
        }
        AddonAction::Unbind { app, addon } => {
            let app = engine.apps.get(&app)?;
            let addon = engine.addons.get_addon(&addon)?;
            if engine.addons.unbind_with_retry(&app.id, &addon.id)? {
                println!("✓ Unbound {} from {}", addon.name, app.name);
            } else {
                println!("{} was not bound to {}", addon.name, app.name);
            }
        }
    }
    Ok(())
}

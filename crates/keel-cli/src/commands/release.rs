use clap::Subcommand;
use keel_engine::{BuildArtifact, ConfigSnapshot, Engine};

use super::{parse_env, print_release};

#[derive(Subcommand)]
pub enum ReleaseAction {
    /// Record a pending release from a build artifact
    Create {
        #[arg(short, long)]
        app: String,
        #[arg(long)]
        revision: String,
        /// Resolved image reference
        #[arg(long)]
        image: String,
        /// Image content digest
        #[arg(long)]
        digest: String,
        /// Environment entries frozen into the release (KEY=VALUE, repeatable)
        #[arg(short, long)]
        env: Vec<String>,
    },
    /// Mark a pending release ready
    Ready { release: String },
    /// Mark a pending release failed
    Fail {
        release: String,
        #[arg(short, long, default_value = "marked failed by operator")]
        reason: String,
    },
    /// List an app's releases, newest first
    List {
        #[arg(short, long)]
        app: String,
    },
    /// Show an app's current release
    Current {
        #[arg(short, long)]
        app: String,
    },
}

pub fn run(engine: &Engine, action: ReleaseAction) -> anyhow::Result<()> {
    match action {
        ReleaseAction::Create {
            app,
            revision,
            image,
            digest,
            env,
        } => {
            let app = engine.apps.get(&app)?;
            let snapshot = ConfigSnapshot::new(
                parse_env(&env)?.into_iter().collect(),
                engine.addons.addon_snapshots_for_app(&app.id)?,
            );
            let release = engine.releases.create_release(
                &app.id,
                BuildArtifact {
                    revision,
                    image_ref: image,
                    image_digest: digest,
                },
                snapshot.to_value()?,
            )?;
            println!("✓ Created release {} for {}", release.id, app.name);
        }
        ReleaseAction::Ready { release } => {
            let release = engine.releases.mark_ready(&release)?;
            print_release(&release);
        }
        ReleaseAction::Fail { release, reason } => {
            let release = engine.releases.mark_failed(&release, &reason)?;
            print_release(&release);
        }
        ReleaseAction::List { app } => {
            let app = engine.apps.get(&app)?;
            for release in engine.releases.list_releases(&app.id)? {
                print_release(&release);
            }
        }
        ReleaseAction::Current { app } => {
            let app = engine.apps.get(&app)?;
            match engine.current.get_current(&app.id)? {
                Some(release) => print_release(&release),
                None => println!("{} has no current release", app.name),
            }
        }
    }
    Ok(())
}

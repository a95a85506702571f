pub mod addon;
pub mod app;
pub mod deploy;
pub mod events;
pub mod release;

use keel_state::{Deployment, Release};

pub(crate) fn print_release(release: &Release) {
    println!(
        "{}  {:<8} rev={} digest={} created={}",
        release.id, release.status, release.revision, release.image_digest, release.created_at
    );
}

pub(crate) fn print_deployment(deployment: &Deployment) {
    println!(
        "{}  {:<11} {} -> {}  updated={}",
        deployment.id,
        deployment.status,
        deployment.from_release_id.as_deref().unwrap_or("-"),
        deployment.to_release_id,
        deployment.updated_at
    );
    if let Some(error) = &deployment.error {
        println!("    error: {error}");
    }
}

/// Parse `KEY=VALUE` pairs given on the command line.
pub(crate) fn parse_env(pairs: &[String]) -> anyhow::Result<Vec<(String, String)>> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => anyhow::bail!("expected KEY=VALUE, got {pair:?}"),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_pairs_split_on_first_equals() {
        let parsed = parse_env(&["URL=postgres://h/db?a=b".to_string()]).unwrap();
        assert_eq!(parsed, [("URL".to_string(), "postgres://h/db?a=b".to_string())]);
        assert!(parse_env(&["=x".to_string()]).is_err());
        assert!(parse_env(&["novalue".to_string()]).is_err());
    }
}

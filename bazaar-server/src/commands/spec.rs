//! Writes the `OpenAPI` document to a file or stdout.

use std::{
    fs,
    io::{self, Write},
    path::Path,
};

use anyhow::Context;
use server::openapi::ApiDoc;
use utoipa::OpenApi;

/// Renders the document. `output` may be a file path (format picked from the
/// extension, YAML by default), the literal `json` or `yaml` to stream that
/// format to stdout, or `None` for YAML on stdout.
pub fn generate_spec(output: Option<&str>) -> anyhow::Result<()> {
    let openapi = ApiDoc::openapi();

    match output {
        None | Some("yaml") => write_stdout(&openapi.to_yaml()?),
        Some("json") => write_stdout(&openapi.to_pretty_json()?),
        Some(path) => {
            let path = Path::new(path);
            let rendered = match path.extension().and_then(|ext| ext.to_str()) {
                Some("json") => openapi.to_pretty_json()?,
                _ => openapi.to_yaml()?,
            };
            fs::write(path, rendered)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("OpenAPI spec written to {}", path.display());
            Ok(())
        }
    }
}

fn write_stdout(rendered: &str) -> anyhow::Result<()> {
    io::stdout().write_all(rendered.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_json_when_the_extension_asks_for_it() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bazaar.json");

        generate_spec(path.to_str()).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["info"]["title"], "Bazaar API");
    }

    #[test]
    fn defaults_to_yaml_for_other_extensions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bazaar.yaml");

        generate_spec(path.to_str()).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("openapi:"));
        assert!(text.contains("/api/chat-token"));
    }
}

//! Plugin-server definition file.
//!
//! The gateway hands us a single YAML path whose top level is a sequence
//! of server definitions. A missing path means "no external plugins" and
//! is not an error; a malformed file fails startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::HostError;

/// One configured plugin server.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PluginServerConf {
    /// Display name, defaulted to `plugin server #<i>` by position.
    #[serde(default)]
    pub name: String,

    /// UNIX socket the server listens on once up.
    pub socket: PathBuf,

    /// Executable to supervise. Servers without `exec` are expected to be
    /// started externally; the host only connects to them.
    #[serde(default)]
    pub exec: Option<PathBuf>,

    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment, overlaid on the host's own.
    #[serde(default)]
    pub environment: HashMap<String, String>,

    /// Command whose stdout advertises the plugins this server carries.
    #[serde(default)]
    pub info_cmd: Option<String>,
}

/// Load the server definitions, or an empty list when no path is
/// configured.
pub fn load_server_defs(path: Option<&Path>) -> Result<Vec<PluginServerConf>, HostError> {
    let Some(path) = path else {
        info!("no external plugin servers configured");
        return Ok(Vec::new());
    };
    let text = std::fs::read_to_string(path)
        .map_err(|e| HostError::Config(format!("{}: {e}", path.display())))?;
    let mut defs: Vec<PluginServerConf> = serde_yaml::from_str(&text)
        .map_err(|e| HostError::Config(format!("{}: {e}", path.display())))?;

    for (i, def) in defs.iter_mut().enumerate() {
        if def.name.is_empty() {
            def.name = format!("plugin server #{i}");
        }
        if def.socket.as_os_str().is_empty() {
            return Err(HostError::Config(format!(
                "server '{}' has an empty socket path",
                def.name
            )));
        }
    }
    Ok(defs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn parses_a_full_server_definition() {
        let file = write_config(
            r#"
- name: A
  socket: /tmp/a.sock
  exec: /bin/a
  args: ["-v"]
  environment:
    GOPATH: /opt/go
  info_cmd: "echo '[{name: p, priority: 10, version: v1, schema: {}, phases: [access]}]'"
"#,
        );
        let defs = load_server_defs(Some(file.path())).unwrap();
        assert_eq!(defs.len(), 1);
        let def = &defs[0];
        assert_eq!(def.name, "A");
        assert_eq!(def.socket, PathBuf::from("/tmp/a.sock"));
        assert_eq!(def.exec.as_deref(), Some(Path::new("/bin/a")));
        assert_eq!(def.args, vec!["-v"]);
        assert_eq!(def.environment.get("GOPATH").unwrap(), "/opt/go");
        assert!(def.info_cmd.as_deref().unwrap().starts_with("echo"));
    }

    #[test]
    fn names_default_by_position() {
        let file = write_config(
            "- socket: /tmp/a.sock\n- socket: /tmp/b.sock\n  name: custom\n- socket: /tmp/c.sock\n",
        );
        let defs = load_server_defs(Some(file.path())).unwrap();
        assert_eq!(defs[0].name, "plugin server #0");
        assert_eq!(defs[1].name, "custom");
        assert_eq!(defs[2].name, "plugin server #2");
    }

    #[test]
    fn missing_path_is_a_noop() {
        assert!(load_server_defs(None).unwrap().is_empty());
    }

    #[test]
    fn malformed_yaml_fails_startup() {
        let file = write_config("- socket: [unclosed\n");
        assert!(matches!(
            load_server_defs(Some(file.path())),
            Err(HostError::Config(_))
        ));
    }

    #[test]
    fn socket_is_required() {
        let file = write_config("- name: A\n  exec: /bin/a\n");
        assert!(load_server_defs(Some(file.path())).is_err());
    }
}

use std::path::{Path, PathBuf};
use std::process::Command;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use minijinja::{context, Environment, UndefinedBehavior};
use crate::config::HaproxyConfig;
use crate::reconciler::{RenderState, ServiceState};

const TEMPLATE_NAME: &str = "haproxy.cfg";

/// Destination for reconciled state.
pub trait ConfigSink {
    fn commit(&mut self, state: &RenderState) -> Result<()>;
}

impl<S: ConfigSink + ?Sized> ConfigSink for &mut S {
    fn commit(&mut self, state: &RenderState) -> Result<()> {
        (**self).commit(state)
    }
}

/// Renders state into the load-balancer config file and asks it to reload.
pub struct HaproxyCommitter {
    env: Environment<'static>,
    config_path: PathBuf,
    reload_command: Vec<String>,
}

impl HaproxyCommitter {
    /// Load and parse the template. A parse failure here is fatal at startup.
    pub fn load(config: &HaproxyConfig) -> Result<Self> {
        let source = std::fs::read_to_string(&config.template_path)
            .with_context(|| format!("Failed to read template {}", config.template_path.display()))?;
        Self::from_source(source, &config.config_path, config.reload_command.clone())
    }

    pub fn from_source(source: String, config_path: &Path, reload_command: Vec<String>) -> Result<Self> {
        if reload_command.is_empty() {
            bail!("reload command is empty");
        }

        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_template_owned(TEMPLATE_NAME, source)
            .context("Failed to parse config template")?;

        Ok(Self {
            env,
            config_path: config_path.to_path_buf(),
            reload_command,
        })
    }

    pub fn render(&self, state: &RenderState) -> Result<String> {
        let services: Vec<&ServiceState> = state.services.values().collect();
        let unmatched: Vec<String> = state.unmatched.iter().map(ToString::to_string).collect();

        self.env
            .get_template(TEMPLATE_NAME)?
            .render(context! {
                services => services,
                unmatched => unmatched,
                generated_at => Utc::now().to_rfc3339(),
            })
            .context("Failed to render config template")
    }

    /// Write through a sibling temp file so the load balancer never reads a partial config.
    fn write(&self, contents: &str) -> Result<()> {
        let mut tmp = self.config_path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, contents)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.config_path)
            .with_context(|| format!("Failed to replace {}", self.config_path.display()))?;
        Ok(())
    }

    fn reload(&self) -> Result<()> {
        let (program, args) = self
            .reload_command
            .split_first()
            .context("reload command is empty")?;

        let output = Command::new(program)
            .args(args)
            .arg(&self.config_path)
            .output()
            .with_context(|| format!("Failed to run {}", program))?;

        if !output.status.success() {
            bail!(
                "{} exited with {}: {}{}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }
}

impl ConfigSink for HaproxyCommitter {
    /// Render, write and reload. A failed reload leaves the new file in place.
    fn commit(&mut self, state: &RenderState) -> Result<()> {
        let rendered = self.render(state)?;
        self.write(&rendered)?;
        self.reload().context("Failed to reload haproxy")?;
        tracing::info!(
            "Updated haproxy config with {} services ({} without endpoints)",
            state.services.len(),
            state.unmatched.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use shared::types::{Protocol, ServiceIdentity};
    use crate::reconciler::PortState;

    const TEMPLATE: &str = "\
{% for svc in services %}{% for port in svc.ports %}\
listen {{ svc.name }}-{{ port.name }}
    bind *:{{ port.proxy_port }}
{% for backend in svc.backends %}    server {{ svc.name }}-{{ loop.index }} {{ backend }}
{% endfor %}{% endfor %}{% endfor %}\
{% for name in unmatched %}# no endpoints: {{ name }}
{% endfor %}";

    fn state() -> RenderState {
        let id = ServiceIdentity::new("ns", "foo").unwrap();
        let service = ServiceState {
            name: "ns-foo".to_string(),
            namespace: "ns".to_string(),
            service: "foo".to_string(),
            portal_ip: "10.0.0.10".parse().unwrap(),
            public_ips: Vec::new(),
            revision: "7".to_string(),
            ports: vec![PortState {
                key: "ns/foo:80".to_string(),
                name: "80".to_string(),
                port: 80,
                protocol: Protocol::Tcp,
                proxy_port: 40001,
            }],
            backends: vec!["10.0.0.1:8080".parse().unwrap(), "10.0.0.2:8080".parse().unwrap()],
        };
        RenderState {
            services: BTreeMap::from([(id, service)]),
            unmatched: vec![ServiceIdentity::new("ns", "lonely").unwrap()],
        }
    }

    fn committer(dir: &Path, reload: &[&str]) -> HaproxyCommitter {
        HaproxyCommitter::from_source(
            TEMPLATE.to_string(),
            &dir.join("haproxy.cfg"),
            reload.iter().map(|s| s.to_string()).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_render_template() {
        let dir = tempfile::tempdir().unwrap();
        let rendered = committer(dir.path(), &["true"]).render(&state()).unwrap();

        assert_eq!(
            rendered,
            "listen ns-foo-80\n    bind *:40001\n    server ns-foo-1 10.0.0.1:8080\n    server ns-foo-2 10.0.0.2:8080\n# no endpoints: ns/lonely\n"
        );
    }

    #[test]
    fn test_sample_template_skips_udp_ports() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state();
        let svc = state.services.values_mut().next().unwrap();
        svc.ports.push(PortState {
            key: "ns/foo:dns".to_string(),
            name: "dns".to_string(),
            port: 53,
            protocol: Protocol::Udp,
            proxy_port: 40002,
        });

        let c = HaproxyCommitter::from_source(
            include_str!("../haproxy.cfg.j2").to_string(),
            &dir.path().join("haproxy.cfg"),
            vec!["true".to_string()],
        )
        .unwrap();
        let rendered = c.render(&state).unwrap();

        assert!(rendered.contains("listen ns-foo-80\n    bind *:40001"));
        assert!(rendered.contains("server ns-foo-2 10.0.0.2:8080 check"));
        assert!(!rendered.contains("40002"));
        assert!(rendered.contains("# ns/lonely has no endpoints"));
    }

    #[test]
    fn test_template_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = HaproxyCommitter::from_source(
            "{% for svc in services %}".to_string(),
            &dir.path().join("haproxy.cfg"),
            vec!["true".to_string()],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_strict_undefined_fails_render() {
        let dir = tempfile::tempdir().unwrap();
        let c = HaproxyCommitter::from_source(
            "{{ missing.field }}".to_string(),
            &dir.path().join("haproxy.cfg"),
            vec!["true".to_string()],
        )
        .unwrap();
        assert!(c.render(&state()).is_err());
    }

    #[test]
    fn test_commit_writes_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("reloaded");
        let script = format!("cp \"$0\" {}", marker.display());
        let mut c = committer(dir.path(), &["sh", "-c", &script]);

        c.commit(&state()).unwrap();

        let written = std::fs::read_to_string(dir.path().join("haproxy.cfg")).unwrap();
        assert!(written.contains("bind *:40001"));
        assert_eq!(std::fs::read_to_string(marker).unwrap(), written);
    }

    #[test]
    fn test_failed_reload_keeps_written_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = committer(dir.path(), &["false"]);

        let err = c.commit(&state()).unwrap_err();

        assert!(format!("{:#}", err).contains("Failed to reload haproxy"));
        assert!(dir.path().join("haproxy.cfg").exists());
    }
}

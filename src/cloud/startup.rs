//! Startup script injected into new instances.
//!
//! The script joins the mesh first so the container engine can bind its TCP
//! listener to the mesh address only. The proxy's admin API listens on all
//! interfaces.

use secrecy::{ExposeSecret, SecretString};

/// Proxy build with the cloud DNS challenge plugin.
const PROXY_DOWNLOAD_URL: &str = "https://caddyserver.com/api/download?os=linux&arch=amd64&p=github.com%2Fcaddy-dns%2Fgoogleclouddns";

#[derive(Debug, Clone)]
pub struct StartupScript {
    /// Mesh hostname; the instance name.
    pub hostname: String,
    pub mesh_auth_key: SecretString,
    pub mesh_tag: String,
    pub runtime_port: u16,
    pub proxy_admin_port: u16,
    /// Appended verbatim after the built-in steps.
    pub extra: Option<String>,
}

impl StartupScript {
    pub fn render(&self) -> String {
        let mut script = format!(
            r#"#!/bin/bash
set -euxo pipefail
export DEBIAN_FRONTEND=noninteractive

# mesh agent
curl -fsSL https://tailscale.com/install.sh | sh
tailscale up --authkey='{auth_key}' --hostname='{hostname}' --advertise-tags='{tag}' --ssh=false
MESH_IP="$(tailscale ip -4)"

# container engine, also listening on the mesh address
curl -fsSL https://get.docker.com | sh
mkdir -p /etc/systemd/system/docker.service.d
cat > /etc/systemd/system/docker.service.d/mesh.conf <<UNIT
[Service]
ExecStart=
ExecStart=/usr/bin/dockerd -H fd:// -H tcp://${{MESH_IP}}:{runtime_port} --containerd=/run/containerd/containerd.sock
UNIT
systemctl daemon-reload
systemctl restart docker

# reverse proxy, admin API on all interfaces
if ! command -v caddy >/dev/null; then
  curl -fsSL -o /usr/local/bin/caddy '{proxy_url}'
  chmod +x /usr/local/bin/caddy
fi
mkdir -p /etc/caddy
cat > /etc/caddy/caddy.json <<'JSON'
{{"admin": {{"listen": "0.0.0.0:{admin_port}"}}}}
JSON
cat > /etc/systemd/system/caddy.service <<'UNIT'
[Unit]
Description=Caddy
After=network-online.target

[Service]
ExecStart=/usr/local/bin/caddy run --resume --config /etc/caddy/caddy.json
Restart=always
AmbientCapabilities=CAP_NET_BIND_SERVICE

[Install]
WantedBy=multi-user.target
UNIT
systemctl daemon-reload
systemctl enable --now caddy
"#,
            auth_key = self.mesh_auth_key.expose_secret(),
            hostname = self.hostname,
            tag = self.mesh_tag,
            runtime_port = self.runtime_port,
            proxy_url = PROXY_DOWNLOAD_URL,
            admin_port = self.proxy_admin_port,
        );

        if let Some(extra) = self.extra.as_deref().filter(|s| !s.trim().is_empty()) {
            script.push_str("\n# caller-supplied\n");
            script.push_str(extra);
            if !extra.ends_with('\n') {
                script.push('\n');
            }
        }
        script
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(extra: Option<&str>) -> StartupScript {
        StartupScript {
            hostname: "infra-1a2b3c4d".to_string(),
            mesh_auth_key: SecretString::from("tskey-auth-xyz"),
            mesh_tag: "tag:infra-vm".to_string(),
            runtime_port: 2375,
            proxy_admin_port: 2019,
            extra: extra.map(String::from),
        }
    }

    #[test]
    fn test_render_contains_join_and_listeners() {
        let text = script(None).render();
        assert!(text.starts_with("#!/bin/bash\n"));
        assert!(text.contains("--authkey='tskey-auth-xyz'"));
        assert!(text.contains("--hostname='infra-1a2b3c4d'"));
        assert!(text.contains("--advertise-tags='tag:infra-vm'"));
        assert!(text.contains("-H tcp://${MESH_IP}:2375"));
        assert!(text.contains(r#"{"admin": {"listen": "0.0.0.0:2019"}}"#));
        assert!(!text.contains("caller-supplied"));
    }

    #[test]
    fn test_extra_appended_verbatim_at_end() {
        let text = script(Some("apt-get install -y htop")).render();
        assert!(text.ends_with("apt-get install -y htop\n"));
        let join = text.find("tailscale up").unwrap();
        let extra = text.find("htop").unwrap();
        assert!(join < extra);
    }
}

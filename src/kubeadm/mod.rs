//! Kubeadm config rendering.
//!
//! Picks the kubeadm API dialect and CRI socket for a target Kubernetes
//! version and renders the init/join YAML from typed variable structs.
//! The cgroup driver is never configured by the user, it is probed on the
//! target host and injected into the rendered documents.

use crate::ssh::Fabric;
use crate::utils::versionutil;
use anyhow::{Context, Result, bail};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    V1Beta1,
    V1Beta2,
    V1Beta3,
}

impl ApiVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            ApiVersion::V1Beta1 => "kubeadm.k8s.io/v1beta1",
            ApiVersion::V1Beta2 => "kubeadm.k8s.io/v1beta2",
            ApiVersion::V1Beta3 => "kubeadm.k8s.io/v1beta3",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriSocket {
    Docker,
    Containerd,
}

impl CriSocket {
    pub fn path(self) -> &'static str {
        match self {
            CriSocket::Docker => "/var/run/dockershim.sock",
            CriSocket::Containerd => "/run/containerd/containerd.sock",
        }
    }
}

/// Dialect thresholds by major.minor, pre-release suffixes stripped.
pub fn select_dialect(version: &str) -> (ApiVersion, CriSocket) {
    let (major, _) = versionutil::major_minor(version);
    if major < 120 {
        (ApiVersion::V1Beta1, CriSocket::Docker)
    } else if major < 123 {
        (ApiVersion::V1Beta2, CriSocket::Containerd)
    } else {
        (ApiVersion::V1Beta3, CriSocket::Containerd)
    }
}

/// One-line probes for the cgroup driver actually in use on a host.
pub fn cgroup_probe_cmd(cri: CriSocket) -> &'static str {
    match cri {
        CriSocket::Docker => r#"driver=$(docker info -f "{{.CgroupDriver}}") && echo "${driver}""#,
        CriSocket::Containerd => {
            r#"driver=$(grep SystemdCgroup /etc/containerd/config.toml | awk -F= '{print $2}') && if [ "$driver" = " true" ]; then echo systemd; else echo cgroupfs; fi"#
        }
    }
}

pub fn probe_cgroup_driver(fabric: &dyn Fabric, host: &str, cri: CriSocket) -> Result<String> {
    let output = fabric.cmd(host, cgroup_probe_cmd(cri))?;
    let driver = output.split_whitespace().last().unwrap_or("").to_string();
    let driver = if driver.is_empty() {
        "cgroupfs".to_string()
    } else {
        driver
    };
    println!("[{}] cgroup driver is {}", host, driver);
    Ok(driver)
}

/// Variables for the init document set. Validated before rendering so a
/// missing field fails the command instead of producing malformed YAML.
#[derive(Debug, Clone)]
pub struct InitVars {
    pub master0_ip: String,
    pub apiserver_domain: String,
    pub vip: String,
    pub version: String,
    pub repo: String,
    pub pod_cidr: String,
    pub svc_cidr: String,
    pub dns_domain: String,
    pub cert_sans: Vec<String>,
    pub api_version: ApiVersion,
    pub cri_socket: CriSocket,
    pub cgroup_driver: String,
}

impl InitVars {
    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("master0 ip", &self.master0_ip),
            ("apiserver domain", &self.apiserver_domain),
            ("vip", &self.vip),
            ("version", &self.version),
            ("pod cidr", &self.pod_cidr),
            ("svc cidr", &self.svc_cidr),
            ("dns domain", &self.dns_domain),
            ("cgroup driver", &self.cgroup_driver),
        ] {
            if value.is_empty() {
                bail!("init config variable [{}] is empty", name);
            }
        }
        if self.cert_sans.is_empty() {
            bail!("init config variable [cert sans] is empty");
        }
        Ok(())
    }

    pub fn render(&self) -> Result<String> {
        self.validate()?;
        let sans = yaml_list(&self.cert_sans, 2);
        Ok(format!(
            r#"apiVersion: {api}
kind: InitConfiguration
localAPIEndpoint:
  advertiseAddress: {master0}
  bindPort: 6443
nodeRegistration:
  criSocket: {socket}
---
apiVersion: {api}
kind: ClusterConfiguration
kubernetesVersion: {version}
controlPlaneEndpoint: "{domain}:6443"
imageRepository: {repo}
networking:
  dnsDomain: {dns}
  podSubnet: {pod}
  serviceSubnet: {svc}
apiServer:
  certSANs:
{sans}
---
apiVersion: kubeproxy.config.k8s.io/v1alpha1
kind: KubeProxyConfiguration
mode: "ipvs"
ipvs:
  excludeCIDRs:
  - "{vip}/32"
---
apiVersion: kubelet.config.k8s.io/v1beta1
kind: KubeletConfiguration
cgroupDriver: {driver}
"#,
            api = self.api_version.as_str(),
            master0 = self.master0_ip,
            socket = self.cri_socket.path(),
            version = self.version,
            domain = self.apiserver_domain,
            repo = self.repo,
            dns = self.dns_domain,
            pod = self.pod_cidr,
            svc = self.svc_cidr,
            sans = sans,
            vip = self.vip,
            driver = self.cgroup_driver,
        ))
    }

    /// Apply the same variables to a user-supplied template instead of the
    /// built-in one. Any unresolved placeholder fails the render.
    pub fn render_custom(&self, template: &str) -> Result<String> {
        self.validate()?;
        let rendered = template
            .replace("{{.Master0}}", &self.master0_ip)
            .replace("{{.ApiServer}}", &self.apiserver_domain)
            .replace("{{.VIP}}", &self.vip)
            .replace("{{.Version}}", &self.version)
            .replace("{{.Repo}}", &self.repo)
            .replace("{{.PodCIDR}}", &self.pod_cidr)
            .replace("{{.SvcCIDR}}", &self.svc_cidr)
            .replace("{{.DnsDomain}}", &self.dns_domain)
            .replace("{{.CriSocket}}", self.cri_socket.path())
            .replace("{{.CgroupDriver}}", &self.cgroup_driver)
            .replace("{{.CertSANS}}", &yaml_list(&self.cert_sans, 2));
        if let Some(pos) = rendered.find("{{.") {
            let tail: String = rendered[pos..].chars().take(32).collect();
            bail!("unresolved template variable near [{}]", tail);
        }
        Ok(rendered)
    }
}

/// Variables for a join document, master or node.
#[derive(Debug, Clone)]
pub struct JoinVars {
    pub api_server_endpoint: String,
    pub token: String,
    pub ca_cert_hash: String,
    /// Set for control-plane joins together with `advertise_address`.
    pub certificate_key: Option<String>,
    pub advertise_address: Option<String>,
    pub api_version: ApiVersion,
    pub cri_socket: CriSocket,
    pub cgroup_driver: String,
}

impl JoinVars {
    fn validate(&self) -> Result<()> {
        if self.api_server_endpoint.is_empty() {
            bail!("join config variable [api server endpoint] is empty");
        }
        if self.token.is_empty() {
            bail!("join config variable [token] is empty");
        }
        if self.ca_cert_hash.is_empty() {
            bail!("join config variable [ca cert hash] is empty");
        }
        if self.certificate_key.is_some() != self.advertise_address.is_some() {
            bail!("control-plane join needs both certificate key and advertise address");
        }
        Ok(())
    }

    pub fn render(&self) -> Result<String> {
        self.validate()?;
        let mut doc = format!(
            r#"apiVersion: {api}
kind: JoinConfiguration
caCertPath: /etc/kubernetes/pki/ca.crt
discovery:
  bootstrapToken:
    apiServerEndpoint: {endpoint}
    token: {token}
    caCertHashes:
    - {hash}
  timeout: 5m0s
nodeRegistration:
  criSocket: {socket}
  kubeletExtraArgs:
    cgroup-driver: {driver}
"#,
            api = self.api_version.as_str(),
            endpoint = self.api_server_endpoint,
            token = self.token,
            hash = self.ca_cert_hash,
            socket = self.cri_socket.path(),
            driver = self.cgroup_driver,
        );
        if let (Some(key), Some(addr)) = (&self.certificate_key, &self.advertise_address) {
            doc.push_str(&format!(
                r#"controlPlane:
  localAPIEndpoint:
    advertiseAddress: {addr}
    bindPort: 6443
  certificateKey: {key}
"#,
            ));
        }
        Ok(doc)
    }
}

/// What we recover from a rendered config: the values the user actually
/// chose, which may differ from our computed defaults.
#[derive(Debug, Default, PartialEq)]
pub struct ParsedClusterConfig {
    pub dns_domain: String,
    pub cert_sans: Vec<String>,
}

#[derive(Deserialize)]
struct RawClusterConfig {
    kind: Option<String>,
    networking: Option<RawNetworking>,
    #[serde(rename = "apiServer")]
    api_server: Option<RawApiServer>,
}

#[derive(Deserialize)]
struct RawNetworking {
    #[serde(rename = "dnsDomain")]
    dns_domain: Option<String>,
}

#[derive(Deserialize)]
struct RawApiServer {
    #[serde(rename = "certSANs")]
    cert_sans: Option<Vec<String>>,
}

/// Parse the ClusterConfiguration document back out of a multi-document
/// kubeadm config. Returns None when no such document parses, the caller
/// falls back to its computed defaults.
pub fn parse_cluster_config(yaml: &str) -> Option<ParsedClusterConfig> {
    for doc in yaml.split("\n---") {
        let raw: RawClusterConfig = match serde_yaml::from_str(doc) {
            Ok(raw) => raw,
            Err(_) => continue,
        };
        if raw.kind.as_deref() != Some("ClusterConfiguration") {
            continue;
        }
        return Some(ParsedClusterConfig {
            dns_domain: raw
                .networking
                .and_then(|n| n.dns_domain)
                .unwrap_or_default(),
            cert_sans: raw
                .api_server
                .and_then(|a| a.cert_sans)
                .unwrap_or_default(),
        });
    }
    None
}

fn yaml_list(items: &[String], indent: usize) -> String {
    items
        .iter()
        .map(|i| format!("{}- {}", " ".repeat(indent), i))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Decode a `kubeadm config` document written by [`InitVars::render`],
/// used in tests and for recovering user-template choices.
pub fn decode_init_config(yaml: &str) -> Result<ParsedClusterConfig> {
    parse_cluster_config(yaml).context("no ClusterConfiguration document found")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> InitVars {
        let (api, cri) = select_dialect("v1.21.0");
        InitVars {
            master0_ip: "10.0.0.1".into(),
            apiserver_domain: "apiserver.cluster.local".into(),
            vip: "10.103.97.2".into(),
            version: "v1.21.0".into(),
            repo: "k8s.gcr.io".into(),
            pod_cidr: "100.64.0.0/10".into(),
            svc_cidr: "10.96.0.0/12".into(),
            dns_domain: "cluster.local".into(),
            cert_sans: vec!["127.0.0.1".into(), "10.0.0.1".into()],
            api_version: api,
            cri_socket: cri,
            cgroup_driver: "systemd".into(),
        }
    }

    #[test]
    fn test_dialect_thresholds() {
        assert_eq!(
            select_dialect("v1.19.8"),
            (ApiVersion::V1Beta1, CriSocket::Docker)
        );
        assert_eq!(
            select_dialect("v1.21.0"),
            (ApiVersion::V1Beta2, CriSocket::Containerd)
        );
        assert_eq!(
            select_dialect("v1.24.0"),
            (ApiVersion::V1Beta3, CriSocket::Containerd)
        );
        assert_eq!(
            select_dialect("v1.23.0-rc.1"),
            (ApiVersion::V1Beta3, CriSocket::Containerd)
        );
    }

    #[test]
    fn test_render_init() {
        let yaml = vars().render().unwrap();
        assert!(yaml.contains("kubeadm.k8s.io/v1beta2"));
        assert!(yaml.contains("criSocket: /run/containerd/containerd.sock"));
        assert!(yaml.contains("cgroupDriver: systemd"));
        assert!(yaml.contains("- \"10.103.97.2/32\""));

        let parsed = decode_init_config(&yaml).unwrap();
        assert_eq!(parsed.dns_domain, "cluster.local");
        assert_eq!(parsed.cert_sans, vec!["127.0.0.1", "10.0.0.1"]);
    }

    #[test]
    fn test_render_init_rejects_missing_vars() {
        let mut v = vars();
        v.vip = String::new();
        assert!(v.render().is_err());
    }

    #[test]
    fn test_render_custom_template() {
        let tmpl = "endpoint: {{.ApiServer}}:6443\nversion: {{.Version}}\n";
        let got = vars().render_custom(tmpl).unwrap();
        assert_eq!(got, "endpoint: apiserver.cluster.local:6443\nversion: v1.21.0\n");

        let bad = vars().render_custom("oops: {{.NoSuchVar}}").unwrap_err();
        assert!(bad.to_string().contains("unresolved"));
    }

    #[test]
    fn test_render_join_node_and_master() {
        let (api, cri) = select_dialect("v1.21.0");
        let mut join = JoinVars {
            api_server_endpoint: "10.103.97.2:6443".into(),
            token: "abcdef.0123456789abcdef".into(),
            ca_cert_hash: "sha256:deadbeef".into(),
            certificate_key: None,
            advertise_address: None,
            api_version: api,
            cri_socket: cri,
            cgroup_driver: "cgroupfs".into(),
        };
        let node_doc = join.render().unwrap();
        assert!(node_doc.contains("apiServerEndpoint: 10.103.97.2:6443"));
        assert!(!node_doc.contains("controlPlane"));

        join.certificate_key = Some("ffeeddcc".into());
        join.advertise_address = Some("10.0.0.2".into());
        let master_doc = join.render().unwrap();
        assert!(master_doc.contains("certificateKey: ffeeddcc"));
        assert!(master_doc.contains("advertiseAddress: 10.0.0.2"));

        join.advertise_address = None;
        assert!(join.render().is_err());
    }
}

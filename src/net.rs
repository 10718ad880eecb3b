//! CNI manifest seam.
//!
//! The manifest templating engine is a collaborator, not part of the
//! orchestrator: a renderer takes a template and returns the YAML to
//! apply. The offline package ships the template for the chosen plugin
//! under `conf/net/` on the bootstrap master.

use anyhow::{Result, bail};

/// Cluster facts a renderer may substitute into its template.
#[derive(Debug, Clone, Default)]
pub struct CniMeta {
    pub cidr: String,
    pub interface: String,
    pub mtu: String,
    pub repo: String,
}

pub trait CniRenderer: Sync {
    fn manifests(&self, template: &str) -> Result<String>;
}

/// Renderer for the package-shipped template: substitutes the cluster
/// facts where the template asks for them and passes everything else
/// through untouched.
pub struct PackagedCni {
    pub meta: CniMeta,
}

impl CniRenderer for PackagedCni {
    fn manifests(&self, template: &str) -> Result<String> {
        let rendered = template
            .replace("{{.CIDR}}", &self.meta.cidr)
            .replace("{{.Interface}}", &self.meta.interface)
            .replace("{{.MTU}}", &self.meta.mtu)
            .replace("{{.CniRepo}}", &self.meta.repo);
        if let Some(pos) = rendered.find("{{.") {
            let tail: String = rendered[pos..].chars().take(32).collect();
            bail!("unresolved cni template variable near [{}]", tail);
        }
        Ok(rendered)
    }
}

//! Coordination-service path layout
//!
//! ```text
//! {root}/services/{host:port}/{module_name}/{service_name}   ephemeral leaf
//! {root}/processes/{process_id}                              ephemeral
//! {root}/modules/{module_name}                               reserved
//! ```
//!
//! Parents are persistent because other modules may share them.

/// Builds every path the registry and discovery touch.
#[derive(Debug, Clone)]
pub struct CoordinationPaths {
    root: String,
}

impl CoordinationPaths {
    pub fn new(root: impl Into<String>) -> Self {
        CoordinationPaths { root: root.into() }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn services_root(&self) -> String {
        format!("{}/services", self.root)
    }

    pub fn processes_root(&self) -> String {
        format!("{}/processes", self.root)
    }

    pub fn modules_root(&self) -> String {
        format!("{}/modules", self.root)
    }

    pub fn process_path(&self, process_id: &str) -> String {
        format!("{}/{}", self.processes_root(), process_id)
    }

    /// `{root}/services/{host:port}`
    pub fn host_path(&self, address: &str) -> String {
        format!("{}/{}", self.services_root(), address)
    }

    /// `{root}/services/{host:port}/{module_name}`
    pub fn module_path(&self, address: &str, module_name: &str) -> String {
        format!("{}/{}", self.host_path(address), module_name)
    }

    /// `{root}/services/{host:port}/{module_name}/{service_name}`
    pub fn service_path(&self, address: &str, module_name: &str, service_name: &str) -> String {
        format!("{}/{}", self.module_path(address, module_name), service_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_bit_exact() {
        let paths = CoordinationPaths::new("/basenode");
        assert_eq!(paths.services_root(), "/basenode/services");
        assert_eq!(paths.processes_root(), "/basenode/processes");
        assert_eq!(
            paths.host_path("10.0.0.1:9527"),
            "/basenode/services/10.0.0.1:9527"
        );
        assert_eq!(
            paths.service_path("10.0.0.1:9527", "GuildModule", "303"),
            "/basenode/services/10.0.0.1:9527/GuildModule/303"
        );
    }
}

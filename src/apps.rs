//! Built-in hosted applications.

use crate::environment::{ConfigTemplate, EnvValue, EnvironmentDefinition};

/// Dependency name of the PHP runtime.
pub const PHP_RUNTIME: &str = "php";

/// Another hosted application whose API this one consumes.
#[derive(Debug, Clone, Copy)]
pub struct Upstream {
    pub app: &'static str,
    /// Appended to the upstream loopback URL.
    pub api_path: &'static str,
}

/// Describes one hosted application; the launcher processes these as a list.
#[derive(Debug, Clone, Copy)]
pub struct AppDefinition {
    pub name: &'static str,
    pub display_name: &'static str,
    /// Name of the staged release dependency.
    pub release: &'static str,
    /// Document root relative to the release directory, empty for the release root.
    pub document_root: &'static str,
    pub upstream: Option<Upstream>,
    /// Only started while integration is enabled.
    pub requires_integration: bool,
    pub environment: EnvironmentDefinition,
    /// Extra PHP scripts, relative to the release directory, run beside the server.
    pub aux_scripts: &'static [&'static str],
    /// Removed by a wipe; the application recreates them on start.
    pub database_files: &'static [&'static str],
}

impl AppDefinition {
    pub fn upstream_url(&self, upstream_loopback: &str) -> Option<String> {
        self.upstream.map(|upstream| {
            format!(
                "{}/{}",
                upstream_loopback.trim_end_matches('/'),
                upstream.api_path
            )
        })
    }
}

pub const GROCY: AppDefinition = AppDefinition {
    name: "grocy",
    display_name: "grocy",
    release: "grocy",
    document_root: "public",
    upstream: None,
    requires_integration: false,
    environment: EnvironmentDefinition {
        config_template: Some(ConfigTemplate {
            source: "config-dist.php",
            target: "config.php",
        }),
        data_path_marker: Some("embedded.txt"),
        variables: &[],
    },
    aux_scripts: &[],
    database_files: &["grocy.db"],
};

pub const BARCODE_BUDDY: AppDefinition = AppDefinition {
    name: "barcodebuddy",
    display_name: "Barcode Buddy",
    release: "barcodebuddy",
    document_root: "",
    upstream: Some(Upstream {
        app: "grocy",
        api_path: "api/",
    }),
    requires_integration: true,
    environment: EnvironmentDefinition {
        config_template: None,
        data_path_marker: None,
        variables: &[
            ("BBUDDY_CONFIG_PATH", EnvValue::DataFile("config.php")),
            ("BBUDDY_DB_PATH", EnvValue::DataFile("barcodebuddy.db")),
            ("BBUDDY_AUTHDB_PATH", EnvValue::DataFile("users.db")),
            ("BBUDDY_GROCY_API_URL", EnvValue::UpstreamUrl),
        ],
    },
    aux_scripts: &["wsserver.php"],
    database_files: &["barcodebuddy.db"],
};

/// All hosted applications, upstreams before their consumers.
pub fn all() -> &'static [AppDefinition] {
    &[GROCY, BARCODE_BUDDY]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstreams_precede_consumers() {
        for (index, app) in all().iter().enumerate() {
            if let Some(upstream) = app.upstream {
                let position = all().iter().position(|a| a.name == upstream.app).unwrap();
                assert!(position < index, "{} starts before {}", upstream.app, app.name);
            }
        }
    }

    #[test]
    fn upstream_url_appends_api_path() {
        assert_eq!(
            BARCODE_BUDDY.upstream_url("http://127.0.0.1:8111/").as_deref(),
            Some("http://127.0.0.1:8111/api/")
        );
        assert_eq!(GROCY.upstream_url("http://127.0.0.1:8111/"), None);
    }
}

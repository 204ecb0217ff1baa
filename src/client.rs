// src/client.rs

//! CLI client talking to the HTTP API
//!
//! Reads the client configuration (instances and users), queries the
//! configured instance and renders the results as plain-text tables.

use crate::database::PackageSearchResult;
use crate::error::{Error, Result};
use crate::packages::{Dependency, Package};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Client configuration resolved to one instance
#[derive(Debug, Default, Clone)]
pub struct ClientConfig {
    pub instance: String,
    pub url: String,
    pub user_name: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClientConfigFile {
    #[serde(default)]
    instance: HashMap<String, InstanceSection>,
    #[serde(default)]
    user: HashMap<String, UserSection>,
}

#[derive(Debug, Deserialize)]
struct InstanceSection {
    url: String,
    #[serde(default)]
    user: String,
}

#[derive(Debug, Deserialize)]
struct UserSection {
    password: String,
}

impl ClientConfig {
    /// Parse the configuration file, selecting `instance` (or the only one)
    pub fn parse(path: &Path, instance: Option<&str>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Unable to read config file {}: {e}", path.display()))
        })?;
        let file: ClientConfigFile = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Unable to parse config file: {e}")))?;

        let (name, section) = match instance {
            Some(wanted) => file
                .instance
                .get_key_value(wanted)
                .ok_or_else(|| Error::Config(format!("Instance \"{wanted}\" not configured")))?,
            None => file
                .instance
                .iter()
                .next()
                .ok_or_else(|| Error::Config("No instance configured".to_string()))?,
        };
        if section.url.is_empty() {
            return Err(Error::Config(format!(
                "No \"url\" specified for instance \"{name}\""
            )));
        }

        let mut config = ClientConfig {
            instance: name.clone(),
            url: section.url.clone(),
            user_name: section.user.clone(),
            password: String::new(),
        };
        if !config.user_name.is_empty() {
            let user = file.user.get(&config.user_name).ok_or_else(|| {
                Error::Config(format!(
                    "User \"{}\" referenced in instance configuration not found",
                    config.user_name
                ))
            })?;
            if user.password.is_empty() {
                return Err(Error::Config(format!(
                    "No \"password\" specified for user \"{}\"",
                    config.user_name
                )));
            }
            config.password = user.password.clone();
        }
        Ok(config)
    }
}

async fn fetch(config: &ClientConfig, path: &str) -> Result<String> {
    let url = format!("{}{path}", config.url.trim_end_matches('/'));
    let client = reqwest::Client::new();
    let mut request = client.get(&url);
    if !config.user_name.is_empty() {
        request = request.basic_auth(&config.user_name, Some(&config.password));
    }
    let response = request
        .send()
        .await
        .map_err(|e| Error::Io(format!("Unable to connect: {e} (URL was: {url})")))?;
    if !response.status().is_success() {
        return Err(Error::Io(format!(
            "HTTP request not successful: {} (URL was: {url})",
            response.status()
        )));
    }
    response
        .text()
        .await
        .map_err(|e| Error::Io(format!("Unable to read response: {e}")))
}

fn encode_query_value(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

/// `search --term <t> [--mode <m>]`
pub async fn search(config: &ClientConfig, term: &str, mode: &str) -> Result<()> {
    let body = fetch(
        config,
        &format!(
            "/api/v0/packages?mode={}&name={}",
            encode_query_value(mode),
            encode_query_value(term)
        ),
    )
    .await?;
    let results: Vec<PackageSearchResult> = serde_json::from_str(&body)
        .map_err(|e| Error::Parse(format!("Unable to parse response: {e}")))?;

    let mut rows = vec![vec![
        "Arch".to_string(),
        "Repo".to_string(),
        "Name".to_string(),
        "Version".to_string(),
        "Description".to_string(),
    ]];
    for result in &results {
        let arch = result
            .pkg
            .package_info
            .as_ref()
            .map(|info| info.arch.clone())
            .unwrap_or_else(|| result.db.arch.clone());
        rows.push(vec![
            arch,
            result.db.name.clone(),
            result.pkg.name.clone(),
            result.pkg.version.clone(),
            result.pkg.description.clone(),
        ]);
    }
    print_table(&rows);
    Ok(())
}

/// `package --name <n>`
pub async fn show_package(config: &ClientConfig, name: &str) -> Result<()> {
    let body = fetch(
        config,
        &format!(
            "/api/v0/packages?mode=name&details=1&name={}",
            encode_query_value(name)
        ),
    )
    .await?;
    let packages: Vec<Package> = serde_json::from_str(&body)
        .map_err(|e| Error::Parse(format!("Unable to parse response: {e}")))?;

    for package in &packages {
        println!("{} {}", package.name, package.version);
        let mut rows = Vec::new();
        if let Some(info) = &package.package_info {
            rows.push(vec!["Arch".to_string(), info.arch.clone()]);
        } else if let Some(source_info) = &package.source_info {
            rows.push(vec!["Archs".to_string(), source_info.archs.join(", ")]);
        }
        rows.push(vec!["Description".to_string(), package.description.clone()]);
        rows.push(vec![
            "Upstream URL".to_string(),
            package.upstream_url.clone(),
        ]);
        rows.push(vec!["License(s)".to_string(), package.licenses.join(", ")]);
        rows.push(vec!["Groups".to_string(), package.groups.join(", ")]);
        if let Some(install_info) = &package.install_info {
            rows.push(vec![
                "Installed size".to_string(),
                format_data_size(install_info.installed_size),
            ]);
        }
        if let Some(info) = &package.package_info {
            if info.size != 0 {
                rows.push(vec!["Package size".to_string(), format_data_size(info.size)]);
            }
            if !info.packager.is_empty() {
                rows.push(vec!["Packager".to_string(), info.packager.clone()]);
            }
            if let Some(build_date) = info.build_date {
                rows.push(vec!["Build date".to_string(), build_date.to_rfc3339()]);
            }
        }
        rows.push(vec![
            "Dependencies".to_string(),
            format_dependencies(&package.dependencies),
        ]);
        rows.push(vec![
            "Optional dependencies".to_string(),
            format_dependencies(&package.optional_dependencies),
        ]);
        if let Some(source_info) = &package.source_info {
            rows.push(vec![
                "Make dependencies".to_string(),
                format_dependencies(&source_info.make_dependencies),
            ]);
            rows.push(vec![
                "Check dependencies".to_string(),
                format_dependencies(&source_info.check_dependencies),
            ]);
        }
        rows.push(vec![
            "Provides".to_string(),
            format_dependencies(&package.provides),
        ]);
        rows.push(vec![
            "Replaces".to_string(),
            format_dependencies(&package.replaces),
        ]);
        rows.push(vec![
            "Conflicts".to_string(),
            format_dependencies(&package.conflicts),
        ]);
        rows.push(vec![
            "Contained libraries".to_string(),
            package.libprovides.join(", "),
        ]);
        rows.push(vec![
            "Needed libraries".to_string(),
            package.libdepends.join(", "),
        ]);
        print_table(&rows);
        println!();
    }
    Ok(())
}

fn format_dependencies(dependencies: &[Dependency]) -> String {
    dependencies
        .iter()
        .map(Dependency::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_data_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

/// Render rows as left-aligned columns sized to their content
fn print_table(rows: &[Vec<String>]) {
    let column_count = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut widths = vec![0usize; column_count];
    for row in rows {
        for (column, cell) in row.iter().enumerate() {
            widths[column] = widths[column].max(cell.chars().count());
        }
    }
    for row in rows {
        let mut line = String::new();
        for (column, cell) in row.iter().enumerate() {
            if column + 1 == row.len() {
                line.push_str(cell);
            } else {
                line.push_str(&format!("{cell:<width$}  ", width = widths[column]));
            }
        }
        println!("{}", line.trim_end());
    }
}

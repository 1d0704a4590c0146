//! Client for the upstream package index: the `pkgbase.gz` master list and
//! the RPC info endpoint.

use std::io::Read;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use flate2::read::GzDecoder;
use serde::Deserialize;

use crate::model::Package;

/// The RPC endpoint rejects larger batches; callers never need more either.
pub const RPC_BATCH_LIMIT: usize = 250;

const DEFAULT_RPC_URL: &str = "https://aur.archlinux.org/rpc/";
const DEFAULT_INDEX_URL: &str = "https://aur.archlinux.org/pkgbase.gz";

/// Read-only view of the upstream package index. The production
/// implementation is [`AurClient`]; tests substitute their own.
#[async_trait]
pub trait PackageIndex: Send + Sync {
    /// Every known package base name.
    async fn list_bases(&self) -> Result<Vec<String>>;

    /// Resolve package metadata for a batch of package names. Unknown names
    /// are silently absent from the result; an empty input yields an empty
    /// result without a network round trip.
    async fn infos(&self, names: &[String]) -> Result<Vec<Package>>;
}

pub struct AurClient {
    http: reqwest::Client,
    rpc_url: String,
    index_url: String,
}

impl AurClient {
    pub fn new() -> Result<Self> {
        Ok(AurClient {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .context("failed to build HTTP client")?,
            rpc_url: DEFAULT_RPC_URL.to_string(),
            index_url: DEFAULT_INDEX_URL.to_string(),
        })
    }

    #[cfg(test)]
    fn with_urls(rpc_url: String, index_url: String) -> Self {
        AurClient {
            http: reqwest::Client::new(),
            rpc_url,
            index_url,
        }
    }
}

#[async_trait]
impl PackageIndex for AurClient {
    async fn list_bases(&self) -> Result<Vec<String>> {
        let bytes = self
            .http
            .get(&self.index_url)
            .send()
            .await
            .context("failed to fetch package base index")?
            .error_for_status()?
            .bytes()
            .await?;
        parse_base_index(&bytes)
    }

    async fn infos(&self, names: &[String]) -> Result<Vec<Package>> {
        let mut packages = vec![];
        for chunk in names.chunks(RPC_BATCH_LIMIT) {
            let mut query: Vec<(&str, &str)> = vec![("v", "5"), ("type", "info")];
            for name in chunk {
                query.push(("arg[]", name));
            }
            let response: RpcResponse = self
                .http
                .get(&self.rpc_url)
                .query(&query)
                .send()
                .await
                .context("failed to query package info endpoint")?
                .error_for_status()?
                .json()
                .await
                .context("malformed package info response")?;
            if let Some(error) = response.error {
                bail!("package info endpoint returned an error: {error}");
            }
            packages.extend(response.results.into_iter().map(Package::from));
        }
        Ok(packages)
    }
}

/// The master list is gzip-compressed newline-delimited text whose first
/// line is a generation header, not a package base.
fn parse_base_index(bytes: &[u8]) -> Result<Vec<String>> {
    let mut text = String::new();
    GzDecoder::new(bytes)
        .read_to_string(&mut text)
        .context("package base index is not valid gzip")?;
    Ok(text
        .lines()
        .skip(1)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    results: Vec<RpcPackage>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RpcPackage {
    name: String,
    #[serde(rename = "PackageBaseID")]
    package_base_id: i64,
    package_base: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(rename = "URL", default)]
    url: Option<String>,
    #[serde(default)]
    num_votes: i64,
    #[serde(default)]
    popularity: f64,
    #[serde(default)]
    out_of_date: Option<i64>,
    #[serde(default)]
    maintainer: Option<String>,
    #[serde(default)]
    first_submitted: Option<i64>,
    #[serde(default)]
    last_modified: Option<i64>,
    #[serde(rename = "URLPath", default)]
    url_path: Option<String>,
    #[serde(default)]
    depends: Vec<String>,
    #[serde(default)]
    make_depends: Vec<String>,
    #[serde(default)]
    check_depends: Vec<String>,
    #[serde(default)]
    opt_depends: Vec<String>,
    #[serde(default)]
    conflicts: Vec<String>,
    #[serde(default)]
    provides: Vec<String>,
    #[serde(default)]
    replaces: Vec<String>,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    license: Vec<String>,
    #[serde(default)]
    keywords: Vec<String>,
}

impl From<RpcPackage> for Package {
    fn from(pkg: RpcPackage) -> Self {
        Package {
            name: pkg.name,
            package_base_id: pkg.package_base_id,
            package_base: pkg.package_base,
            version: pkg.version,
            description: pkg.description.unwrap_or_default(),
            url: pkg.url.unwrap_or_default(),
            num_votes: pkg.num_votes,
            popularity: pkg.popularity,
            out_of_date: pkg.out_of_date.and_then(epoch),
            maintainer: pkg.maintainer.unwrap_or_default(),
            first_submitted: pkg.first_submitted.and_then(epoch),
            last_modified: pkg.last_modified.and_then(epoch),
            url_path: pkg.url_path.unwrap_or_default(),
            depends: pkg.depends,
            make_depends: pkg.make_depends,
            check_depends: pkg.check_depends,
            opt_depends: pkg.opt_depends,
            conflicts: pkg.conflicts,
            provides: pkg.provides,
            replaces: pkg.replaces,
            groups: pkg.groups,
            license: pkg.license,
            keywords: pkg.keywords,
        }
    }
}

fn epoch(seconds: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn base_index_skips_header_and_blank_lines() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(b"# AUR package base list generated on ...\nfoo\nbar\n\nbaz\n")
            .unwrap();
        let bytes = encoder.finish().unwrap();

        let bases = parse_base_index(&bytes).unwrap();
        assert_eq!(bases, vec!["foo", "bar", "baz"]);
    }

    #[test]
    fn base_index_rejects_plain_text() {
        assert!(parse_base_index(b"not gzip").is_err());
    }

    #[test]
    fn rpc_package_maps_to_model() {
        let json = r#"{
            "version": 5, "type": "multiinfo", "resultcount": 1,
            "results": [{
                "ID": 999, "Name": "foo-git", "PackageBaseID": 42,
                "PackageBase": "foo", "Version": "1.2-1",
                "Description": "a package", "URL": "https://example.org",
                "NumVotes": 3, "Popularity": 0.25,
                "OutOfDate": null, "Maintainer": null,
                "FirstSubmitted": 1000000000, "LastModified": 1100000000,
                "URLPath": "/cgit/aur.git/snapshot/foo.tar.gz",
                "Depends": ["glibc"], "MakeDepends": ["git"],
                "CheckDepends": [], "License": ["GPL"], "Keywords": []
            }]
        }"#;
        let response: RpcResponse = serde_json::from_str(json).unwrap();
        let pkg = Package::from(response.results.into_iter().next().unwrap());

        assert_eq!(pkg.name, "foo-git");
        assert_eq!(pkg.package_base, "foo");
        assert_eq!(pkg.package_base_id, 42);
        assert_eq!(pkg.version, "1.2-1");
        assert_eq!(pkg.maintainer, "");
        assert_eq!(pkg.out_of_date, None);
        assert_eq!(pkg.depends, vec!["glibc"]);
        assert_eq!(pkg.make_depends, vec!["git"]);
        assert_eq!(
            pkg.first_submitted.unwrap(),
            Utc.timestamp_opt(1000000000, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn empty_info_batch_never_hits_the_network() {
        // An unroutable URL: reaching it would fail the test.
        let client = AurClient::with_urls(
            "http://192.0.2.1/rpc/".into(),
            "http://192.0.2.1/pkgbase.gz".into(),
        );
        let packages = client.infos(&[]).await.unwrap();
        assert!(packages.is_empty());
    }
}

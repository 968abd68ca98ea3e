//! Amazon S3 object store backend.
//!
//! Talks to the S3 REST API directly with AWS Signature V4 authentication,
//! using only pure-Rust dependencies (`hmac`, `sha2`) for signing. Custom
//! endpoints are supported for S3-compatible services (MinIO, LocalStack).
//!
//! The catalog listing pages through the bucket's **full version history**
//! (`GET /?versions`) rather than `ListObjectsV2`: only entries marked
//! `IsLatest` are kept, and a key whose latest event is a delete marker is
//! dropped. The version id reported there is the engine's sole staleness
//! signal.
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID` — required
//! - `AWS_SECRET_ACCESS_KEY` — required
//! - `AWS_SESSION_TOKEN` — optional (temporary credentials / IAM roles)

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::StoreConfig;
use crate::error::SyncError;
use crate::models::{Catalog, ObjectListing, RemoteObject};

use super::{key_filename, ObjectStore};

type HmacSha256 = Hmac<Sha256>;

/// AWS credentials loaded from environment variables.
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

/// S3-backed [`ObjectStore`].
pub struct S3Store {
    config: StoreConfig,
    creds: AwsCredentials,
    client: reqwest::Client,
    include: GlobSet,
    exclude: GlobSet,
}

impl S3Store {
    /// Build a store from config, reading credentials from the environment.
    pub fn new(config: StoreConfig) -> Result<Self> {
        let creds = AwsCredentials::from_env()?;
        let include = build_globset(&config.include_globs)?;
        let exclude = build_globset(&config.exclude_globs)?;
        Ok(Self {
            config,
            creds,
            client: reqwest::Client::new(),
            include,
            exclude,
        })
    }

    fn host(&self) -> String {
        if let Some(ref endpoint) = self.config.endpoint_url {
            endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string()
        } else {
            format!(
                "{}.s3.{}.amazonaws.com",
                self.config.bucket, self.config.region
            )
        }
    }

    fn scheme(&self) -> &'static str {
        match self.config.endpoint_url {
            Some(ref e) if e.starts_with("http://") => "http",
            _ => "https",
        }
    }

    /// Build a SigV4-signed request. `canonical_uri` must already be
    /// URI-encoded, `query` is sorted into the canonical form here.
    fn signed_request(
        &self,
        method: reqwest::Method,
        canonical_uri: &str,
        query: &[(String, String)],
        payload: Vec<u8>,
    ) -> reqwest::RequestBuilder {
        let host = self.host();
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(&payload);

        let mut sorted = query.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical_querystring: String = sorted
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let mut headers = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_querystring,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(
            &self.creds.secret_access_key,
            &date_stamp,
            &self.config.region,
            "s3",
        );
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let url = if canonical_querystring.is_empty() {
            format!("{}://{}{}", self.scheme(), host, canonical_uri)
        } else {
            format!(
                "{}://{}{}?{}",
                self.scheme(),
                host,
                canonical_uri,
                canonical_querystring
            )
        };

        let mut builder = self
            .client
            .request(method, &url)
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);
        if let Some(ref token) = self.creds.session_token {
            builder = builder.header("x-amz-security-token", token);
        }
        if !payload.is_empty() {
            builder = builder.body(payload);
        }
        builder
    }

    fn encoded_key_path(key: &str) -> String {
        let encoded = key
            .split('/')
            .map(uri_encode)
            .collect::<Vec<_>>()
            .join("/");
        format!("/{}", encoded)
    }

    /// Whether a listed key participates in sync at all.
    fn key_selected(&self, key: &str) -> bool {
        let rel = if self.config.prefix.is_empty() {
            key.to_string()
        } else {
            let prefix = self.config.prefix.trim_end_matches('/');
            key.strip_prefix(prefix)
                .map(|s| s.trim_start_matches('/').to_string())
                .unwrap_or_else(|| key.to_string())
        };
        !self.exclude.is_match(&rel) && self.include.is_match(&rel)
    }

    /// HEAD one object for its current version id and modification time.
    async fn head(&self, key: &str) -> Result<RemoteObject> {
        let resp = self
            .signed_request(
                reqwest::Method::HEAD,
                &Self::encoded_key_path(key),
                &[],
                Vec::new(),
            )
            .send()
            .await
            .with_context(|| format!("HEAD s3://{}/{} failed", self.config.bucket, key))?;

        if !resp.status().is_success() {
            bail!(
                "S3 HeadObject failed (HTTP {}) for key '{}'",
                resp.status(),
                key
            );
        }

        let version_id = header_string(&resp, "x-amz-version-id").unwrap_or_else(|| "null".into());
        let last_modified = header_string(&resp, "last-modified")
            .and_then(|v| DateTime::parse_from_rfc2822(&v).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(RemoteObject {
            version_id,
            last_modified,
        })
    }
}

fn header_string(resp: &reqwest::Response, name: &str) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list_current(&self) -> Result<Catalog, SyncError> {
        let mut catalog = Catalog::new();
        let mut key_marker: Option<String> = None;
        let mut version_marker: Option<String> = None;

        loop {
            let mut query = vec![
                ("versions".to_string(), String::new()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !self.config.prefix.is_empty() {
                query.push(("prefix".to_string(), self.config.prefix.clone()));
            }
            if let Some(ref marker) = key_marker {
                query.push(("key-marker".to_string(), marker.clone()));
            }
            if let Some(ref marker) = version_marker {
                query.push(("version-id-marker".to_string(), marker.clone()));
            }

            let resp = self
                .signed_request(reqwest::Method::GET, "/", &query, Vec::new())
                .send()
                .await
                .map_err(|e| SyncError::CatalogUnavailable(e.to_string()))?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(SyncError::CatalogUnavailable(format!(
                    "S3 ListObjectVersions failed (HTTP {}): {}",
                    status,
                    body.chars().take(500).collect::<String>()
                )));
            }

            let xml = resp
                .text()
                .await
                .map_err(|e| SyncError::CatalogUnavailable(e.to_string()))?;
            let page = parse_list_versions_response(&xml);

            for version in page.versions {
                if !version.is_latest {
                    continue;
                }
                // Pseudo-folders and the bare prefix key are not documents.
                if version.key.ends_with('/') && version.size == 0 {
                    continue;
                }
                if version.key == self.config.prefix && !self.config.prefix.is_empty() {
                    continue;
                }
                if !self.key_selected(&version.key) {
                    continue;
                }
                catalog.insert(
                    version.key,
                    RemoteObject {
                        version_id: version.version_id,
                        last_modified: version.last_modified,
                    },
                );
            }
            for marker in page.delete_markers {
                if marker.is_latest {
                    catalog.remove(&marker.key);
                }
            }

            if page.is_truncated {
                key_marker = page.next_key_marker;
                version_marker = page.next_version_id_marker;
                if key_marker.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        Ok(catalog)
    }

    async fn list_for_display(&self) -> Result<Vec<ObjectListing>, SyncError> {
        let mut listing = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !self.config.prefix.is_empty() {
                query.push(("prefix".to_string(), self.config.prefix.clone()));
            }
            if let Some(ref token) = continuation {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let resp = self
                .signed_request(reqwest::Method::GET, "/", &query, Vec::new())
                .send()
                .await
                .map_err(|e| SyncError::CatalogUnavailable(e.to_string()))?;

            if !resp.status().is_success() {
                return Err(SyncError::CatalogUnavailable(format!(
                    "S3 ListObjectsV2 failed (HTTP {})",
                    resp.status()
                )));
            }

            let xml = resp
                .text()
                .await
                .map_err(|e| SyncError::CatalogUnavailable(e.to_string()))?;
            let (objects, is_truncated, next_token) = parse_list_objects_response(&xml);

            for obj in objects {
                if obj.key.ends_with('/') && obj.size == 0 {
                    continue;
                }
                if obj.key == self.config.prefix && !self.config.prefix.is_empty() {
                    continue;
                }
                listing.push(ObjectListing {
                    filename: key_filename(&obj.key),
                    public_url: self.public_url(&obj.key),
                    last_modified: Some(obj.last_modified.to_rfc3339()),
                    size: obj.size,
                    key: obj.key,
                });
            }

            if is_truncated {
                continuation = next_token;
                if continuation.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        listing.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(listing)
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>, SyncError> {
        let resp = self
            .signed_request(
                reqwest::Method::GET,
                &Self::encoded_key_path(key),
                &[],
                Vec::new(),
            )
            .send()
            .await
            .map_err(|e| SyncError::FetchFailed {
                key: key.to_string(),
                detail: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(SyncError::FetchFailed {
                key: key.to_string(),
                detail: format!("HTTP {}", resp.status()),
            });
        }

        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| SyncError::FetchFailed {
                key: key.to_string(),
                detail: e.to_string(),
            })
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<RemoteObject> {
        let resp = self
            .signed_request(
                reqwest::Method::PUT,
                &Self::encoded_key_path(key),
                &[],
                bytes,
            )
            .send()
            .await
            .with_context(|| format!("PUT s3://{}/{} failed", self.config.bucket, key))?;

        if !resp.status().is_success() {
            bail!(
                "S3 PutObject failed (HTTP {}) for key '{}'",
                resp.status(),
                key
            );
        }

        // The PUT response carries the new version id on versioned buckets;
        // HEAD fills in last-modified and covers unversioned buckets.
        let put_version = header_string(&resp, "x-amz-version-id");
        let mut remote = self.head(key).await?;
        if let Some(version) = put_version {
            remote.version_id = version;
        }
        Ok(remote)
    }

    fn public_url(&self, key: &str) -> String {
        format!(
            "{}/{}",
            self.config.public_base(),
            key.trim_start_matches('/')
        )
    }
}

// ============ AWS SigV4 Helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// Derive the SigV4 signing key:
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode per RFC 3986 (unreserved characters pass through).
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

// ============ XML Parsing (minimal, string-scan) ============

/// One `<Version>` entry from a `ListObjectVersions` response.
struct VersionEntry {
    key: String,
    version_id: String,
    is_latest: bool,
    last_modified: DateTime<Utc>,
    size: i64,
}

/// One `<DeleteMarker>` entry.
struct DeleteMarkerEntry {
    key: String,
    is_latest: bool,
}

struct ListVersionsPage {
    versions: Vec<VersionEntry>,
    delete_markers: Vec<DeleteMarkerEntry>,
    is_truncated: bool,
    next_key_marker: Option<String>,
    next_version_id_marker: Option<String>,
}

fn parse_list_versions_response(xml: &str) -> ListVersionsPage {
    let mut versions = Vec::new();
    for block in xml_blocks(xml, "Version") {
        let key = extract_xml_value(block, "Key").unwrap_or_default();
        if key.is_empty() {
            continue;
        }
        versions.push(VersionEntry {
            key,
            version_id: extract_xml_value(block, "VersionId").unwrap_or_else(|| "null".into()),
            is_latest: extract_xml_value(block, "IsLatest").as_deref() == Some("true"),
            last_modified: extract_xml_value(block, "LastModified")
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_default()),
            size: extract_xml_value(block, "Size")
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(0),
        });
    }

    let mut delete_markers = Vec::new();
    for block in xml_blocks(xml, "DeleteMarker") {
        let key = extract_xml_value(block, "Key").unwrap_or_default();
        if key.is_empty() {
            continue;
        }
        delete_markers.push(DeleteMarkerEntry {
            key,
            is_latest: extract_xml_value(block, "IsLatest").as_deref() == Some("true"),
        });
    }

    ListVersionsPage {
        versions,
        delete_markers,
        is_truncated: extract_xml_value(xml, "IsTruncated").as_deref() == Some("true"),
        next_key_marker: extract_xml_value(xml, "NextKeyMarker"),
        next_version_id_marker: extract_xml_value(xml, "NextVersionIdMarker"),
    }
}

/// One `<Contents>` entry from a `ListObjectsV2` response.
struct ContentsEntry {
    key: String,
    last_modified: DateTime<Utc>,
    size: i64,
}

fn parse_list_objects_response(xml: &str) -> (Vec<ContentsEntry>, bool, Option<String>) {
    let mut objects = Vec::new();
    for block in xml_blocks(xml, "Contents") {
        let key = extract_xml_value(block, "Key").unwrap_or_default();
        if key.is_empty() {
            continue;
        }
        objects.push(ContentsEntry {
            key,
            last_modified: extract_xml_value(block, "LastModified")
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_default()),
            size: extract_xml_value(block, "Size")
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(0),
        });
    }
    let is_truncated = extract_xml_value(xml, "IsTruncated").as_deref() == Some("true");
    let next_token = extract_xml_value(xml, "NextContinuationToken");
    (objects, is_truncated, next_token)
}

/// Iterate the inner text of every `<tag>...</tag>` block.
fn xml_blocks<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut blocks = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find(&open) {
        let block_start = start + open.len();
        match remaining[block_start..].find(&close) {
            Some(end) => {
                blocks.push(&remaining[block_start..block_start + end]);
                remaining = &remaining[block_start + end + close.len()..];
            }
            None => break,
        }
    }
    blocks
}

/// Extract the text content of a simple, non-nested XML tag.
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)?;
    let value_start = start + open.len();
    let end = xml[value_start..].find(&close)?;
    Some(xml[value_start..value_start + end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_VERSIONS_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListVersionsResult>
  <IsTruncated>false</IsTruncated>
  <Version>
    <Key>docs/alpha.pdf</Key>
    <VersionId>ver-a2</VersionId>
    <IsLatest>true</IsLatest>
    <LastModified>2024-06-01T10:00:00.000Z</LastModified>
    <Size>2048</Size>
  </Version>
  <Version>
    <Key>docs/alpha.pdf</Key>
    <VersionId>ver-a1</VersionId>
    <IsLatest>false</IsLatest>
    <LastModified>2024-05-01T10:00:00.000Z</LastModified>
    <Size>1024</Size>
  </Version>
  <Version>
    <Key>docs/gone.txt</Key>
    <VersionId>ver-g1</VersionId>
    <IsLatest>false</IsLatest>
    <LastModified>2024-05-02T10:00:00.000Z</LastModified>
    <Size>10</Size>
  </Version>
  <DeleteMarker>
    <Key>docs/gone.txt</Key>
    <VersionId>marker-1</VersionId>
    <IsLatest>true</IsLatest>
  </DeleteMarker>
  <Version>
    <Key>docs/folder/</Key>
    <VersionId>ver-f1</VersionId>
    <IsLatest>true</IsLatest>
    <LastModified>2024-05-03T10:00:00.000Z</LastModified>
    <Size>0</Size>
  </Version>
</ListVersionsResult>"#;

    #[test]
    fn only_latest_versions_survive() {
        let page = parse_list_versions_response(LIST_VERSIONS_XML);
        let latest: Vec<_> = page.versions.iter().filter(|v| v.is_latest).collect();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].key, "docs/alpha.pdf");
        assert_eq!(latest[0].version_id, "ver-a2");
    }

    #[test]
    fn delete_markers_parsed_with_latest_flag() {
        let page = parse_list_versions_response(LIST_VERSIONS_XML);
        assert_eq!(page.delete_markers.len(), 1);
        assert_eq!(page.delete_markers[0].key, "docs/gone.txt");
        assert!(page.delete_markers[0].is_latest);
        assert!(!page.is_truncated);
    }

    #[test]
    fn pagination_markers_extracted() {
        let xml = r#"<ListVersionsResult>
  <IsTruncated>true</IsTruncated>
  <NextKeyMarker>docs/m.txt</NextKeyMarker>
  <NextVersionIdMarker>ver-m3</NextVersionIdMarker>
</ListVersionsResult>"#;
        let page = parse_list_versions_response(xml);
        assert!(page.is_truncated);
        assert_eq!(page.next_key_marker.as_deref(), Some("docs/m.txt"));
        assert_eq!(page.next_version_id_marker.as_deref(), Some("ver-m3"));
    }

    #[test]
    fn list_objects_contents_parsed() {
        let xml = r#"<ListBucketResult>
  <IsTruncated>false</IsTruncated>
  <Contents>
    <Key>docs/a.txt</Key>
    <LastModified>2024-06-01T10:00:00.000Z</LastModified>
    <Size>42</Size>
  </Contents>
</ListBucketResult>"#;
        let (objects, truncated, token) = parse_list_objects_response(xml);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].key, "docs/a.txt");
        assert_eq!(objects[0].size, 42);
        assert!(!truncated);
        assert!(token.is_none());
    }

    #[test]
    fn uri_encoding_matches_sigv4_rules() {
        assert_eq!(uri_encode("a b/c"), "a%20b%2Fc");
        assert_eq!(uri_encode("safe-chars_.~"), "safe-chars_.~");
    }
}

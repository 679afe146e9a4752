//! Streaming parser for the scanner's JSON report.
//!
//! The report's outer `Results` array is the unbounded axis: a big repository
//! can produce hundreds of megabytes of findings. The parser therefore walks
//! `Results[*].Vulnerabilities[*]` with deserialize seeds, holding one
//! vulnerability object and at most one in-flight batch at a time, and hands
//! full batches to a sink as it goes. The document is never materialized.

use serde::de::{DeserializeSeed, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;
use thiserror::Error;

use crate::types::Vulnerability;

const CRITICAL: &str = "CRITICAL";

/// Receives each full batch. Returning `Err` aborts the parse.
pub type BatchSink<'a> = &'a mut dyn FnMut(Vec<Vulnerability>) -> Result<(), String>;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("malformed scanner report: {0}")]
    Json(#[from] serde_json::Error),
    #[error("batch delivery failed: {0}")]
    Sink(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportSummary {
    /// Vulnerabilities of any severity seen in the report.
    pub seen: usize,
    /// CRITICAL vulnerabilities delivered to the sink.
    pub kept: usize,
}

/// Stream the report from `reader`, delivering CRITICAL vulnerabilities to
/// `sink` in batches of at most `batch_size` (the final batch may be
/// smaller).
pub fn parse_report<R: std::io::Read>(
    reader: R,
    batch_size: usize,
    sink: BatchSink<'_>,
) -> Result<ReportSummary, ReportError> {
    let mut batcher = Batcher {
        batch: Vec::new(),
        batch_size: batch_size.max(1),
        sink,
        seen: 0,
        kept: 0,
        sink_error: None,
    };

    let mut deserializer = serde_json::Deserializer::from_reader(reader);
    let outcome = ReportSeed {
        batcher: &mut batcher,
    }
    .deserialize(&mut deserializer);
    let outcome = outcome.and_then(|_| deserializer.end());

    if let Err(err) = outcome {
        if let Some(message) = batcher.sink_error.take() {
            return Err(ReportError::Sink(message));
        }
        return Err(ReportError::Json(err));
    }

    batcher.finish()?;
    Ok(ReportSummary {
        seen: batcher.seen,
        kept: batcher.kept,
    })
}

/// Vendor shape of one vulnerability. Every field may be absent.
#[derive(Debug, Deserialize)]
struct RawVulnerability {
    #[serde(rename = "VulnerabilityID")]
    id: Option<String>,
    #[serde(rename = "PkgName")]
    pkg_name: Option<String>,
    #[serde(rename = "InstalledVersion")]
    installed_version: Option<String>,
    #[serde(rename = "FixedVersion")]
    fixed_version: Option<String>,
    #[serde(rename = "Severity")]
    severity: Option<String>,
    #[serde(rename = "Title")]
    title: Option<String>,
    #[serde(rename = "Description")]
    description: Option<String>,
}

fn map_vulnerability(raw: RawVulnerability) -> Vulnerability {
    Vulnerability {
        id: raw.id.unwrap_or_else(|| "unknown".to_string()),
        package: raw.pkg_name.unwrap_or_else(|| "unknown".to_string()),
        installed_version: raw
            .installed_version
            .unwrap_or_else(|| "unknown".to_string()),
        fixed_version: raw.fixed_version,
        severity: CRITICAL.to_string(),
        title: raw.title.unwrap_or_default(),
        description: raw.description.unwrap_or_default(),
    }
}

struct Batcher<'a> {
    batch: Vec<Vulnerability>,
    batch_size: usize,
    sink: BatchSink<'a>,
    seen: usize,
    kept: usize,
    sink_error: Option<String>,
}

impl Batcher<'_> {
    /// Filter, map, and batch one raw vulnerability. A sink failure is
    /// remembered so `parse_report` can tell it apart from a JSON error.
    fn accept<E: serde::de::Error>(&mut self, raw: RawVulnerability) -> Result<(), E> {
        self.seen += 1;
        if raw.severity.as_deref() != Some(CRITICAL) {
            return Ok(());
        }
        self.batch.push(map_vulnerability(raw));
        self.kept += 1;
        if self.batch.len() >= self.batch_size {
            if let Err(message) = self.emit() {
                self.sink_error = Some(message);
                return Err(E::custom("batch delivery failed"));
            }
        }
        Ok(())
    }

    fn emit(&mut self) -> Result<(), String> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        (self.sink)(batch)
    }

    fn finish(&mut self) -> Result<(), ReportError> {
        self.emit().map_err(ReportError::Sink)
    }
}

/// Top-level report object: everything but `Results` is skipped.
struct ReportSeed<'a, 'b> {
    batcher: &'a mut Batcher<'b>,
}

impl<'de> DeserializeSeed<'de> for ReportSeed<'_, '_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for ReportSeed<'_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("a scanner report object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        while let Some(key) = map.next_key::<String>()? {
            if key == "Results" {
                map.next_value_seed(ResultsSeed {
                    batcher: &mut *self.batcher,
                })?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(())
    }
}

/// The `Results` array, streamed entry by entry. `null` is accepted: the
/// scanner emits it for repositories with nothing to report.
struct ResultsSeed<'a, 'b> {
    batcher: &'a mut Batcher<'b>,
}

impl<'de> DeserializeSeed<'de> for ResultsSeed<'_, '_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for ResultsSeed<'_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("a Results array or null")
    }

    fn visit_unit<E: serde::de::Error>(self) -> Result<(), E> {
        Ok(())
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        while seq
            .next_element_seed(ResultEntrySeed {
                batcher: &mut *self.batcher,
            })?
            .is_some()
        {}
        Ok(())
    }
}

/// One `Results` entry: only its `Vulnerabilities` array matters.
struct ResultEntrySeed<'a, 'b> {
    batcher: &'a mut Batcher<'b>,
}

impl<'de> DeserializeSeed<'de> for ResultEntrySeed<'_, '_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for ResultEntrySeed<'_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("a Results entry object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        while let Some(key) = map.next_key::<String>()? {
            if key == "Vulnerabilities" {
                map.next_value_seed(VulnerabilitiesSeed {
                    batcher: &mut *self.batcher,
                })?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(())
    }
}

/// The inner `Vulnerabilities` array (assumed small), or `null`.
struct VulnerabilitiesSeed<'a, 'b> {
    batcher: &'a mut Batcher<'b>,
}

impl<'de> DeserializeSeed<'de> for VulnerabilitiesSeed<'_, '_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for VulnerabilitiesSeed<'_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("a Vulnerabilities array or null")
    }

    fn visit_unit<E: serde::de::Error>(self) -> Result<(), E> {
        Ok(())
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        while let Some(raw) = seq.next_element::<RawVulnerability>()? {
            self.batcher.accept::<A::Error>(raw)?;
        }
        Ok(())
    }
}

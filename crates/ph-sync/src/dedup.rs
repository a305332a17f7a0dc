//! Read-only duplicate report over the source table.

use std::collections::BTreeMap;

use ph_adapters::{SourceError, SourceReader};
use ph_core::{map_record, Cursor, MappingRules, MatchKey, SourceOrder};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupCandidate {
    pub source_id: i64,
    pub label: String,
    pub key: MatchKey,
}

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    pub auto_cluster_threshold: f64,
    pub review_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            auto_cluster_threshold: 0.95,
            review_threshold: 0.85,
        }
    }
}

/// Records sharing an identical normalised key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExactGroup {
    pub key: String,
    pub source_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupClusterProposal {
    pub cluster_id: String,
    pub confidence_score: f64,
    pub members: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupReviewItem {
    pub source_id_a: i64,
    pub source_id_b: i64,
    pub label_a: String,
    pub label_b: String,
    pub confidence_score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DuplicateReport {
    pub scanned: usize,
    pub exact_groups: Vec<ExactGroup>,
    pub clusters: Vec<DedupClusterProposal>,
    pub review: Vec<DedupReviewItem>,
}

impl DuplicateReport {
    pub fn is_clean(&self) -> bool {
        self.exact_groups.is_empty() && self.clusters.is_empty() && self.review.is_empty()
    }

    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            "# Duplicate Report".to_string(),
            String::new(),
            format!("- Records scanned: {}", self.scanned),
            format!("- Exact groups: {}", self.exact_groups.len()),
            format!("- Fuzzy clusters: {}", self.clusters.len()),
            format!("- Pairs for review: {}", self.review.len()),
        ];
        if !self.exact_groups.is_empty() {
            lines.push(String::new());
            lines.push("## Exact".to_string());
            for group in &self.exact_groups {
                lines.push(format!("- `{}`: {:?}", group.key, group.source_ids));
            }
        }
        if !self.clusters.is_empty() {
            lines.push(String::new());
            lines.push("## Clusters".to_string());
            for cluster in &self.clusters {
                lines.push(format!(
                    "- {} ({:.3}): {:?}",
                    cluster.cluster_id, cluster.confidence_score, cluster.members
                ));
            }
        }
        if !self.review.is_empty() {
            lines.push(String::new());
            lines.push("## Review".to_string());
            for item in &self.review {
                lines.push(format!(
                    "- {:.3}: {} / {}",
                    item.confidence_score, item.label_a, item.label_b
                ));
            }
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

pub struct DedupEngine {
    config: DedupConfig,
}

impl DedupEngine {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    pub fn similarity(&self, a: &DedupCandidate, b: &DedupCandidate) -> f64 {
        jaro_winkler(&a.key.name, &b.key.name)
    }

    /// Group candidates by location, then compare names pairwise inside each group.
    pub fn apply(&self, items: &[DedupCandidate]) -> DuplicateReport {
        let mut by_location: BTreeMap<String, Vec<&DedupCandidate>> = BTreeMap::new();
        for item in items {
            let location = match (&item.key.postcode, &item.key.town) {
                (Some(postcode), _) => format!("pc:{postcode}"),
                (None, Some(town)) => format!("town:{town}"),
                (None, None) => "-".to_string(),
            };
            by_location.entry(location).or_default().push(item);
        }

        let mut report = DuplicateReport {
            scanned: items.len(),
            ..Default::default()
        };
        for (location, group) in &by_location {
            let mut exact: BTreeMap<&str, Vec<i64>> = BTreeMap::new();
            for item in group {
                exact.entry(item.key.name.as_str()).or_default().push(item.source_id);
            }
            for (name, ids) in &exact {
                if ids.len() > 1 {
                    report.exact_groups.push(ExactGroup {
                        key: format!("{name}|{location}"),
                        source_ids: ids.clone(),
                    });
                }
            }

            for i in 0..group.len() {
                for j in (i + 1)..group.len() {
                    let (a, b) = (group[i], group[j]);
                    if a.key.name == b.key.name {
                        continue;
                    }
                    let score = self.similarity(a, b);
                    if score >= self.config.auto_cluster_threshold {
                        report.clusters.push(DedupClusterProposal {
                            cluster_id: format!("cluster-{}-{}", a.source_id, b.source_id),
                            confidence_score: score,
                            members: vec![a.source_id, b.source_id],
                        });
                    } else if score >= self.config.review_threshold {
                        report.review.push(DedupReviewItem {
                            source_id_a: a.source_id,
                            source_id_b: b.source_id,
                            label_a: a.label.clone(),
                            label_b: b.label.clone(),
                            confidence_score: score,
                        });
                    }
                }
            }
        }
        report
    }
}

/// Read the whole source in id order and collect one candidate per nameable record.
pub async fn collect_candidates(
    source: &dyn SourceReader,
    page_size: usize,
    rules: &MappingRules,
) -> Result<Vec<DedupCandidate>, SourceError> {
    let page_size = page_size.max(1);
    let mut cursor = Cursor::start(SourceOrder::Id);
    let mut out = Vec::new();
    loop {
        let page = source.read_page(page_size, &cursor).await?;
        let last = page.is_last(page_size);
        for record in &page.records {
            match map_record(record, rules) {
                Ok(target) => out.push(DedupCandidate {
                    source_id: record.id,
                    label: record.label(),
                    key: target.match_key(),
                }),
                Err(err) => debug!("skipping record in duplicate scan: {err}"),
            }
        }
        if last {
            break;
        }
        cursor = page.next_cursor;
    }
    Ok(out)
}

pub async fn scan_duplicates(
    source: &dyn SourceReader,
    page_size: usize,
    rules: &MappingRules,
    config: DedupConfig,
) -> Result<DuplicateReport, SourceError> {
    let candidates = collect_candidates(source, page_size, rules).await?;
    Ok(DedupEngine::new(config).apply(&candidates))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: i64, name: &str, postcode: Option<&str>, town: Option<&str>) -> DedupCandidate {
        DedupCandidate {
            source_id: id,
            label: format!("#{id} {name}"),
            key: MatchKey::new(name, postcode, town),
        }
    }

    #[test]
    fn exact_duplicates_group_by_postcode() {
        let engine = DedupEngine::new(DedupConfig::default());
        let report = engine.apply(&[
            candidate(1, "Baby Sensory Andover", Some("SP10 2BX"), None),
            candidate(4, "baby sensory andover", Some("sp102bx"), None),
            candidate(9, "Baby Sensory Andover", Some("SO23 8TB"), None),
        ]);
        assert_eq!(report.exact_groups.len(), 1);
        assert_eq!(report.exact_groups[0].source_ids, vec![1, 4]);
        assert!(report.clusters.is_empty());
    }

    #[test]
    fn typo_clusters_within_same_postcode() {
        let engine = DedupEngine::new(DedupConfig::default());
        let report = engine.apply(&[
            candidate(1, "Water Babies Winchester", Some("SO23 2LP"), None),
            candidate(2, "Water Babies Winchestr", Some("SO23 2LP"), None),
        ]);
        assert_eq!(report.clusters.len(), 1);
        assert!(report.clusters[0].confidence_score >= 0.95);
    }

    #[test]
    fn different_names_and_places_stay_apart() {
        let engine = DedupEngine::new(DedupConfig::default());
        let report = engine.apply(&[
            candidate(1, "Monkey Music", None, Some("Romsey")),
            candidate(2, "Splash Tots", None, Some("Romsey")),
            candidate(3, "Monkey Music", None, Some("Andover")),
        ]);
        assert!(report.is_clean());
        assert_eq!(report.scanned, 3);
    }

    #[test]
    fn borderline_names_go_to_review() {
        let engine = DedupEngine::new(DedupConfig {
            auto_cluster_threshold: 0.99,
            review_threshold: 0.85,
        });
        let report = engine.apply(&[
            candidate(1, "Tiny Tots Music", Some("SP10 1AA"), None),
            candidate(2, "Tiny Tots Music Club", Some("SP10 1AA"), None),
        ]);
        assert!(report.clusters.is_empty());
        assert_eq!(report.review.len(), 1);
        assert!(report.to_markdown().contains("Pairs for review: 1"));
    }
}

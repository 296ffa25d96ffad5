//! Listing and filtering journal entries.

use crate::manifest::ManifestEntry;

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Exact tag match.
    pub tag: Option<String>,
    /// Case-insensitive substring over id, original name, note and tags.
    pub query: Option<String>,
    pub limit: Option<usize>,
}

impl ListFilter {
    pub fn matches(&self, entry: &ManifestEntry) -> bool {
        if let Some(tag) = &self.tag {
            if !entry.has_tag(tag) {
                return false;
            }
        }
        match &self.query {
            Some(query) => {
                let needle = query.to_lowercase();
                let hit = |text: &str| text.to_lowercase().contains(&needle);
                hit(entry.archive_id.as_str())
                    || hit(&entry.original.name)
                    || hit(&entry.note)
                    || entry.tags.iter().any(|t| hit(t))
            }
            None => true,
        }
    }
}

/// Matching entries, newest first. Equal timestamps list the later journal
/// line first.
pub fn list(entries: Vec<ManifestEntry>, filter: &ListFilter) -> Vec<ManifestEntry> {
    let mut matched: Vec<ManifestEntry> = entries
        .into_iter()
        .filter(|entry| filter.matches(entry))
        .collect();
    matched.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    matched.reverse();
    if let Some(limit) = filter.limit {
        matched.truncate(limit);
    }
    matched
}

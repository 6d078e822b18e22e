//! Target sources for each [`TargetKind`].
//!
//! Catalog calls (list/batch-get) are served from a [`StaticSources`] table
//! registered at startup; execution is kind-specific.

pub mod code;
pub mod http;
pub mod prompt;
pub mod trace;

use loopeval_core::model::SpaceId;
use loopeval_core::storage::Page;
use loopeval_core::target::TargetSourceInfo;
use std::collections::BTreeMap;

pub use code::TemplateTarget;
pub use http::HttpTarget;
pub use prompt::PromptTarget;
pub use trace::TraceReplayTarget;

/// In-process catalog of known sources, optionally scoped per space.
#[derive(Debug, Clone, Default)]
pub struct StaticSources {
    /// `None` key holds sources visible in every space.
    entries: BTreeMap<Option<SpaceId>, Vec<TargetSourceInfo>>,
}

impl StaticSources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, space_id: Option<SpaceId>, info: TargetSourceInfo) -> Self {
        self.entries.entry(space_id).or_default().push(info);
        self
    }

    fn visible(&self, space_id: SpaceId) -> impl Iterator<Item = &TargetSourceInfo> {
        self.entries
            .get(&None)
            .into_iter()
            .chain(self.entries.get(&Some(space_id)))
            .flatten()
    }

    /// Distinct sources in registration order, filtered by name or id substring.
    pub fn list(&self, space_id: SpaceId, keyword: Option<&str>, page: Page) -> Vec<TargetSourceInfo> {
        let kw = keyword.map(str::to_lowercase);
        let mut seen: Vec<&str> = Vec::new();
        let mut out = Vec::new();
        for info in self.visible(space_id) {
            if seen.contains(&info.source_id.as_str()) {
                continue;
            }
            if let Some(k) = &kw {
                let hit = info.name.to_lowercase().contains(k) || info.source_id.to_lowercase().contains(k);
                if !hit {
                    continue;
                }
            }
            seen.push(&info.source_id);
            out.push(info.clone());
        }
        out.into_iter().skip(page.offset).take(page.limit).collect()
    }

    pub fn versions(&self, space_id: SpaceId, source_id: &str, page: Page) -> Vec<TargetSourceInfo> {
        self.visible(space_id)
            .filter(|i| i.source_id == source_id && i.source_version.is_some())
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect()
    }

    pub fn batch_get(&self, space_id: SpaceId, source_ids: &[String]) -> Vec<TargetSourceInfo> {
        source_ids
            .iter()
            .filter_map(|id| self.visible(space_id).find(|i| &i.source_id == id).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn info(id: &str, version: Option<&str>, name: &str) -> TargetSourceInfo {
        TargetSourceInfo {
            source_id: id.into(),
            source_version: version.map(str::to_string),
            name: name.into(),
            description: String::new(),
            extra: json!({}),
        }
    }

    #[test]
    fn test_static_sources_scope_and_filter() {
        let s = StaticSources::new()
            .with(None, info("qa-bot", Some("2"), "QA bot"))
            .with(None, info("qa-bot", Some("1"), "QA bot"))
            .with(Some(7), info("private", None, "Team workflow"));

        let all = s.list(7, None, Page::default());
        assert_eq!(all.iter().map(|i| i.source_id.as_str()).collect::<Vec<_>>(), vec!["qa-bot", "private"]);
        assert_eq!(s.list(8, None, Page::default()).len(), 1);
        assert_eq!(s.list(7, Some("team"), Page::default())[0].source_id, "private");

        let versions = s.versions(7, "qa-bot", Page { offset: 1, limit: 10 });
        assert_eq!(versions[0].source_version.as_deref(), Some("1"));
        assert!(s.batch_get(8, &["private".into()]).is_empty());
    }
}

//! Library entity model.
//!
//! [`EntityRef`] is the read-only view of a host library item that the
//! enrichment core works from. The host owns the entity; the core only reads
//! these fields and writes back a [`ProviderIds`] map through the host store.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ids::EntityId;

// ---------------------------------------------------------------------------
// EntityKind
// ---------------------------------------------------------------------------

/// The kind of a library entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Movie,
    Series,
    Season,
    Episode,
}

impl EntityKind {
    /// Movies match against movie-category search hits; everything else
    /// matches against series-category hits.
    pub fn is_movie(self) -> bool {
        matches!(self, EntityKind::Movie)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityKind::Movie => "movie",
            EntityKind::Series => "series",
            EntityKind::Season => "season",
            EntityKind::Episode => "episode",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ProviderIds
// ---------------------------------------------------------------------------

/// Provider-id map stored on an entity (`"BilibiliID" -> "28223066"`).
///
/// Empty values are treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderIds(BTreeMap<String, String>);

impl ProviderIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the non-empty value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Set `key` to `value`, returning `true` when the stored value changed.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        let value = value.into();
        if self.0.get(&key) == Some(&value) {
            return false;
        }
        self.0.insert(key, value);
        true
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Drop every key in `keys` except `keep`, then set `keep` to `value`.
    ///
    /// Used when an explicit choice of provider must win over whatever other
    /// providers matched earlier.
    pub fn replace_exclusive<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a str>,
        keep: &str,
        value: impl Into<String>,
    ) {
        for key in keys {
            if key != keep {
                self.0.remove(key);
            }
        }
        self.0.insert(keep.to_string(), value.into());
    }

    /// Copy every non-empty entry of `other` into `self`.
    pub fn merge_non_empty(&mut self, other: &ProviderIds) {
        for (k, v) in other.iter() {
            self.0.insert(k.to_string(), v.to_string());
        }
    }

    /// Iterate over non-empty entries.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ProviderIds {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

// ---------------------------------------------------------------------------
// EntityRef
// ---------------------------------------------------------------------------

/// Minimal, read-only description of a library entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: EntityId,
    pub kind: EntityKind,
    /// Display name (movie title, series title, season or episode name).
    pub name: String,
    pub production_year: Option<u16>,
    /// Episode number for episodes, season number for seasons.
    pub index_number: Option<u32>,
    /// Season number an episode belongs to. `None` or `0` marks a special.
    pub parent_index_number: Option<u32>,
    /// Season of an episode, series of a season.
    pub parent_id: Option<EntityId>,
    /// Title of the owning series, for seasons and episodes.
    pub series_name: Option<String>,
    /// Media file path (movies and episodes).
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub provider_ids: ProviderIds,
}

impl EntityRef {
    /// Create an entity with a fresh id and no optional fields set.
    pub fn new(kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(),
            kind,
            name: name.into(),
            production_year: None,
            index_number: None,
            parent_index_number: None,
            parent_id: None,
            series_name: None,
            path: None,
            provider_ids: ProviderIds::new(),
        }
    }

    pub fn movie(name: impl Into<String>) -> Self {
        Self::new(EntityKind::Movie, name)
    }

    pub fn series(name: impl Into<String>) -> Self {
        Self::new(EntityKind::Series, name)
    }

    /// A season of `series`, numbered `index`.
    pub fn season(series: &EntityRef, index: u32) -> Self {
        let mut season = Self::new(EntityKind::Season, format!("Season {index}"));
        season.index_number = Some(index);
        season.parent_id = Some(series.id);
        season.series_name = Some(series.name.clone());
        season.production_year = series.production_year;
        season
    }

    /// An episode of `season`, numbered `index`.
    pub fn episode(season: &EntityRef, index: u32) -> Self {
        let mut episode = Self::new(EntityKind::Episode, format!("Episode {index}"));
        episode.index_number = Some(index);
        episode.parent_index_number = season.index_number;
        episode.parent_id = Some(season.id);
        episode.series_name = season.series_name.clone();
        episode
    }

    #[must_use]
    pub fn with_year(mut self, year: u16) -> Self {
        self.production_year = Some(year);
        self
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_index(mut self, index: Option<u32>) -> Self {
        self.index_number = index;
        self
    }

    #[must_use]
    pub fn with_parent_index(mut self, index: Option<u32>) -> Self {
        self.parent_index_number = index;
        self
    }

    #[must_use]
    pub fn with_provider_id(mut self, key: &str, value: &str) -> Self {
        self.provider_ids.set(key, value);
        self
    }

    /// Name used as the search query: seasons and episodes search by the
    /// owning series' title.
    pub fn search_name(&self) -> &str {
        match self.kind {
            EntityKind::Season | EntityKind::Episode => self
                .series_name
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(&self.name),
            _ => &self.name,
        }
    }

    /// Episodes outside any numbered season (specials, extras).
    pub fn is_special(&self) -> bool {
        matches!(self.parent_index_number, None | Some(0))
    }

    /// Media file path, if the entity has one.
    pub fn media_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, self.index_number) {
            (EntityKind::Episode, Some(i)) => write!(f, "{}.{}", i, self.name),
            _ => f.write_str(&self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_ids_ignore_empty_values() {
        let ids: ProviderIds = [("BilibiliID", ""), ("DandanID", "123")]
            .into_iter()
            .collect();
        assert_eq!(ids.get("BilibiliID"), None);
        assert_eq!(ids.get("DandanID"), Some("123"));
        assert_eq!(ids.iter().count(), 1);
    }

    #[test]
    fn set_reports_changes() {
        let mut ids = ProviderIds::new();
        assert!(ids.set("DandanID", "1"));
        assert!(!ids.set("DandanID", "1"));
        assert!(ids.set("DandanID", "2"));
    }

    #[test]
    fn replace_exclusive_clears_other_providers() {
        let mut ids: ProviderIds = [("BilibiliID", "1"), ("DandanID", "2"), ("Tmdb", "3")]
            .into_iter()
            .collect();
        ids.replace_exclusive(["BilibiliID", "DandanID"], "DandanID", "9");
        assert_eq!(ids.get("BilibiliID"), None);
        assert_eq!(ids.get("DandanID"), Some("9"));
        // keys outside the provider set are untouched
        assert_eq!(ids.get("Tmdb"), Some("3"));
    }

    #[test]
    fn season_and_episode_inherit_series_name() {
        let series = EntityRef::series("三体").with_year(2023);
        let season = EntityRef::season(&series, 1);
        let episode = EntityRef::episode(&season, 3);

        assert_eq!(season.search_name(), "三体");
        assert_eq!(season.production_year, Some(2023));
        assert_eq!(episode.parent_id, Some(season.id));
        assert_eq!(episode.parent_index_number, Some(1));
        assert!(!episode.is_special());
        assert_eq!(episode.to_string(), "3.Episode 3");
    }

    #[test]
    fn specials_have_no_season_index() {
        let series = EntityRef::series("x");
        let specials = EntityRef::season(&series, 0);
        let episode = EntityRef::episode(&specials, 1);
        assert!(episode.is_special());
        assert!(EntityRef::movie("m").with_parent_index(None).is_special());
    }
}

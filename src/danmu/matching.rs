//! Matching engine.
//!
//! Turns a library entity into a provider media id (title normalization,
//! similarity scoring, category and year filters) and aligns a season's
//! local episodes with the provider's episode list.

use std::sync::LazyLock;

use danmu_core::{EntityId, EntityRef, Result};
use regex::Regex;
use tracing::{debug, info, warn};
use unicode_normalization::UnicodeNormalization;

use super::provider::{DanmakuProvider, MediaCategory, SearchHit};

/// Hits scoring below this similarity are never accepted.
pub const MIN_SIMILARITY: f64 = 0.70;

static BRACKETED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\[【(（][^\]】)）]*[\]】)）]").expect("bracket pattern"));

static SEASON_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)第[0-9一二三四五六七八九十百零]+[季部期]|\bseason\s*\d+\b|\b\d+(?:st|nd|rd|th)\s+season\b|\bs\d{1,2}\b",
    )
    .expect("season marker pattern")
});

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern"));

// ---------------------------------------------------------------------------
// Title normalization and similarity
// ---------------------------------------------------------------------------

/// Normalize a display name into a search query.
///
/// Applies NFKC (full-width to half-width), strips bracketed annotations
/// such as `[1080p]` or `（国语）` and season markers such as `第二季` or
/// `Season 2`, then collapses whitespace. If nothing is left the trimmed
/// input is returned.
pub fn normalize_search_name(name: &str) -> String {
    let nfkc: String = name.nfkc().collect();
    let without_brackets = BRACKETED.replace_all(&nfkc, " ");
    let without_season = SEASON_MARKER.replace_all(&without_brackets, " ");
    let collapsed = WHITESPACE.replace_all(without_season.trim(), " ");

    if collapsed.is_empty() {
        nfkc.trim().to_string()
    } else {
        collapsed.into_owned()
    }
}

/// Normalized edit-distance similarity in `0.0..=1.0`, case-insensitive.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&a, &b) as f64 / longest as f64
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

// ---------------------------------------------------------------------------
// Hit selection
// ---------------------------------------------------------------------------

/// Pick the first hit, in provider order, that passes every filter:
/// category must fit the entity kind, similarity of the normalized titles
/// must reach [`MIN_SIMILARITY`], and years must agree when both are known.
pub fn select_best_hit<'a>(entity: &EntityRef, hits: &'a [SearchHit]) -> Option<&'a SearchHit> {
    let target = normalize_search_name(entity.search_name());
    let want_movie = entity.kind.is_movie();

    hits.iter().find(|hit| {
        let is_movie = hit.category == MediaCategory::Movie;
        if is_movie != want_movie {
            debug!(title = %hit.title, category = ?hit.category, "Rejecting hit: category mismatch");
            return false;
        }

        let score = similarity(&target, &normalize_search_name(&hit.title));
        if score < MIN_SIMILARITY {
            debug!(title = %hit.title, score, "Rejecting hit: similarity below threshold");
            return false;
        }

        if let (Some(wanted), Some(found)) = (entity.production_year, hit.year) {
            if wanted != found {
                debug!(title = %hit.title, wanted, found, "Rejecting hit: year mismatch");
                return false;
            }
        }

        true
    })
}

/// Search `provider` for `entity` and apply [`select_best_hit`].
pub async fn resolve_media_id<P>(provider: &P, entity: &EntityRef) -> Result<Option<String>>
where
    P: DanmakuProvider + ?Sized,
{
    let query = normalize_search_name(entity.search_name());
    if query.is_empty() {
        debug!(provider = provider.name(), entity = %entity.id, "Empty search name; nothing to match");
        return Ok(None);
    }

    let hits = provider.search(&query).await?;
    match select_best_hit(entity, &hits) {
        Some(hit) => {
            info!(
                provider = provider.name(),
                query = %query,
                title = %hit.title,
                media_id = %hit.external_id,
                "Matched search hit"
            );
            Ok(Some(hit.external_id.clone()))
        }
        None => {
            info!(
                provider = provider.name(),
                query = %query,
                candidates = hits.len(),
                "No acceptable search hit"
            );
            Ok(None)
        }
    }
}

// ---------------------------------------------------------------------------
// Episode reconciliation
// ---------------------------------------------------------------------------

/// A local episode paired with a provider episode, by position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpisodePair {
    /// Index into the local episode slice.
    pub local: usize,
    /// Index into the provider's episode list.
    pub remote: usize,
}

/// Why a local episode inside the paired range was not paired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingIndex,
    IndexBeyondProvider { index: u32, provider_count: usize },
}

/// Result of pairing a season's episodes with one provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub pairs: Vec<EpisodePair>,
    pub skipped: Vec<(usize, SkipReason)>,
    /// Specials were kept in the count because that made it match.
    pub used_unfiltered: bool,
    /// The provider has fewer episodes than the library; another provider
    /// may complete the rest.
    pub provider_short: bool,
}

/// Outcome of [`reconcile_episodes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Paired(Reconciliation),
    /// Neither the filtered nor the unfiltered local count equals the
    /// provider count; nothing was paired.
    CountMismatch {
        filtered: usize,
        unfiltered: usize,
        provider: usize,
    },
}

/// Align `local` episodes with a provider listing of `provider_count`
/// episodes.
///
/// Specials are left out of the count unless keeping them is what makes
/// the counts equal. Positions are paired index-for-index up to the smaller
/// count. When the counts still disagree, pairing only happens with
/// `allow_partial`.
pub fn reconcile_episodes(
    local: &[EntityRef],
    provider_count: usize,
    allow_partial: bool,
) -> ReconcileOutcome {
    let mut all: Vec<usize> = (0..local.len()).collect();
    all.sort_by_key(|&i| local[i].index_number.unwrap_or(u32::MAX));
    let filtered: Vec<usize> = all
        .iter()
        .copied()
        .filter(|&i| !local[i].is_special())
        .collect();

    let (candidates, used_unfiltered) = if filtered.len() == provider_count {
        (filtered, false)
    } else if all.len() == provider_count {
        (all, true)
    } else if allow_partial {
        (filtered, false)
    } else {
        return ReconcileOutcome::CountMismatch {
            filtered: filtered.len(),
            unfiltered: all.len(),
            provider: provider_count,
        };
    };

    let mut result = Reconciliation {
        used_unfiltered,
        provider_short: provider_count < candidates.len(),
        ..Default::default()
    };

    let paired = candidates.len().min(provider_count);
    for (position, &local_idx) in candidates.iter().take(paired).enumerate() {
        match local[local_idx].index_number.unwrap_or(0) {
            0 => result.skipped.push((local_idx, SkipReason::MissingIndex)),
            index if index as usize > provider_count => result.skipped.push((
                local_idx,
                SkipReason::IndexBeyondProvider {
                    index,
                    provider_count,
                },
            )),
            _ => result.pairs.push(EpisodePair {
                local: local_idx,
                remote: position,
            }),
        }
    }

    ReconcileOutcome::Paired(result)
}

// ---------------------------------------------------------------------------
// Match state machine
// ---------------------------------------------------------------------------

/// Progress of one entity's matching pass against one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchState {
    Unmatched,
    Searching,
    Resolved(String),
    EpisodesPaired(usize),
    CommentsFetched(usize),
    Failed(String),
}

impl MatchState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: &MatchState) -> bool {
        use MatchState::*;
        match (self, next) {
            (CommentsFetched(_) | Failed(_), _) => false,
            (_, Failed(_)) => true,
            (Unmatched, Searching)
            | (Unmatched, Resolved(_))
            | (Searching, Resolved(_))
            | (Resolved(_), EpisodesPaired(_))
            | (EpisodesPaired(_), CommentsFetched(_)) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MatchState::CommentsFetched(_) | MatchState::Failed(_))
    }

    /// At least one comment stream was fetched (or was fetched recently).
    pub fn is_fetched(&self) -> bool {
        matches!(self, MatchState::CommentsFetched(n) if *n > 0)
    }
}

/// Tracks and logs the state of one provider/entity matching pass.
#[derive(Debug)]
pub struct MatchPass {
    provider: &'static str,
    entity: EntityId,
    state: MatchState,
}

impl MatchPass {
    pub fn new(provider: &'static str, entity: EntityId) -> Self {
        Self {
            provider,
            entity,
            state: MatchState::Unmatched,
        }
    }

    pub fn state(&self) -> &MatchState {
        &self.state
    }

    /// Move to `next`, logging the transition.
    pub fn advance(&mut self, next: MatchState) {
        if !self.state.can_transition_to(&next) {
            warn!(
                provider = self.provider,
                entity = %self.entity,
                from = ?self.state,
                to = ?next,
                "Unexpected match state transition"
            );
        }
        debug!(provider = self.provider, entity = %self.entity, state = ?next, "Match state");
        self.state = next;
    }

    /// End the pass as failed.
    pub fn fail(mut self, reason: impl Into<String>) -> MatchState {
        let reason = reason.into();
        info!(provider = self.provider, entity = %self.entity, reason = %reason, "Provider did not match");
        self.advance(MatchState::Failed(reason));
        self.state
    }

    /// End the pass with `fetched` comment streams written.
    pub fn fetched(mut self, fetched: usize) -> MatchState {
        self.advance(MatchState::CommentsFetched(fetched));
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_patterns_compile() {
        LazyLock::force(&BRACKETED);
        LazyLock::force(&SEASON_MARKER);
        LazyLock::force(&WHITESPACE);
    }

    fn hit(id: &str, title: &str, category: MediaCategory, year: Option<u16>) -> SearchHit {
        SearchHit {
            external_id: id.into(),
            title: title.into(),
            category,
            year,
            episode_count: None,
        }
    }

    fn season_of(name: &str, year: Option<u16>) -> EntityRef {
        let mut series = EntityRef::series(name);
        series.production_year = year;
        EntityRef::season(&series, 1)
    }

    fn episodes(indices: &[(Option<u32>, Option<u32>)]) -> Vec<EntityRef> {
        let series = EntityRef::series("x");
        let season = EntityRef::season(&series, 1);
        indices
            .iter()
            .map(|&(index, parent)| {
                EntityRef::episode(&season, 0)
                    .with_index(index)
                    .with_parent_index(parent)
            })
            .collect()
    }

    // -- normalization -------------------------------------------------------

    #[test]
    fn strips_brackets_and_season_markers() {
        assert_eq!(normalize_search_name("[字幕组] 三体 第二季 (2023)"), "三体");
        assert_eq!(normalize_search_name("Attack on Titan Season 2"), "Attack on Titan");
        assert_eq!(normalize_search_name("鬼灭之刃【无限列车篇】"), "鬼灭之刃");
    }

    #[test]
    fn nfkc_folds_full_width() {
        assert_eq!(normalize_search_name("ＳＰＹ×ＦＡＭＩＬＹ"), "SPY×FAMILY");
    }

    #[test]
    fn keeps_name_when_everything_is_bracketed() {
        assert_eq!(normalize_search_name("  [Special]  "), "[Special]");
    }

    #[test]
    fn similarity_bounds() {
        assert!((similarity("三体", "三体") - 1.0).abs() < f64::EPSILON);
        assert!((similarity("", "") - 1.0).abs() < f64::EPSILON);
        assert!(similarity("abc", "xyz") < f64::EPSILON);
        assert!((similarity("Inception", "inception") - 1.0).abs() < f64::EPSILON);
        assert!((similarity("三体", "三体外传") - 0.5).abs() < 1e-9);
    }

    // -- hit selection -------------------------------------------------------

    #[test]
    fn selects_first_acceptable_hit() {
        let entity = season_of("三体", Some(2023));
        let hits = vec![
            hit("1", "三体", MediaCategory::Series, Some(2023)),
            hit("2", "三体外传", MediaCategory::Series, Some(2020)),
        ];
        assert_eq!(select_best_hit(&entity, &hits).unwrap().external_id, "1");
    }

    #[test]
    fn rejects_below_threshold() {
        let entity = season_of("三体", None);
        let hits = vec![hit("2", "三体外传", MediaCategory::Series, None)];
        assert!(select_best_hit(&entity, &hits).is_none());
    }

    #[test]
    fn rejects_category_mismatch() {
        let movie = EntityRef::movie("流浪地球");
        let hits = vec![
            hit("tv", "流浪地球", MediaCategory::Series, None),
            hit("film", "流浪地球", MediaCategory::Movie, None),
        ];
        assert_eq!(select_best_hit(&movie, &hits).unwrap().external_id, "film");

        let season = season_of("流浪地球", None);
        assert_eq!(select_best_hit(&season, &hits).unwrap().external_id, "tv");
    }

    #[test]
    fn rejects_year_mismatch_only_when_both_known() {
        let entity = EntityRef::movie("Dune").with_year(2021);
        let hits = vec![
            hit("old", "Dune", MediaCategory::Movie, Some(1984)),
            hit("unknown", "Dune", MediaCategory::Movie, None),
        ];
        assert_eq!(select_best_hit(&entity, &hits).unwrap().external_id, "unknown");
    }

    #[test]
    fn hit_titles_are_normalized_too() {
        let entity = season_of("进击的巨人", None);
        let hits = vec![hit("s2", "进击的巨人 第二季", MediaCategory::Series, None)];
        assert_eq!(select_best_hit(&entity, &hits).unwrap().external_id, "s2");
    }

    // -- reconciliation ------------------------------------------------------

    #[test]
    fn specials_are_filtered_when_that_matches() {
        let mut layout: Vec<(Option<u32>, Option<u32>)> = (1..=22).map(|i| (Some(i), Some(1))).collect();
        layout.push((Some(1), Some(0)));
        layout.push((Some(2), None));
        let local = episodes(&layout);
        assert_eq!(local.len(), 24);

        let ReconcileOutcome::Paired(rec) = reconcile_episodes(&local, 22, false) else {
            panic!("expected pairing");
        };
        assert_eq!(rec.pairs.len(), 22);
        assert!(!rec.used_unfiltered);
        assert!(rec.pairs.iter().all(|p| !local[p.local].is_special()));
        for pair in &rec.pairs {
            assert_eq!(local[pair.local].index_number, Some(pair.remote as u32 + 1));
        }
    }

    #[test]
    fn unfiltered_count_used_when_it_matches() {
        let mut layout: Vec<(Option<u32>, Option<u32>)> = (1..=22).map(|i| (Some(i), Some(1))).collect();
        layout.push((Some(23), Some(0)));
        layout.push((Some(24), Some(0)));
        let local = episodes(&layout);

        let ReconcileOutcome::Paired(rec) = reconcile_episodes(&local, 24, false) else {
            panic!("expected pairing");
        };
        assert!(rec.used_unfiltered);
        assert_eq!(rec.pairs.len(), 24);
    }

    #[test]
    fn plain_season_pairs_everything() {
        let layout: Vec<(Option<u32>, Option<u32>)> = (1..=24).map(|i| (Some(i), Some(1))).collect();
        let local = episodes(&layout);
        let ReconcileOutcome::Paired(rec) = reconcile_episodes(&local, 24, false) else {
            panic!("expected pairing");
        };
        assert_eq!(rec.pairs.len(), 24);
        assert!(rec.skipped.is_empty());
        assert!(!rec.provider_short);
    }

    #[test]
    fn count_mismatch_pairs_nothing_by_default() {
        let layout: Vec<(Option<u32>, Option<u32>)> = (1..=5).map(|i| (Some(i), Some(1))).collect();
        let local = episodes(&layout);
        assert_eq!(
            reconcile_episodes(&local, 12, false),
            ReconcileOutcome::CountMismatch {
                filtered: 5,
                unfiltered: 5,
                provider: 12
            }
        );
    }

    #[test]
    fn partial_pairing_when_allowed() {
        let layout: Vec<(Option<u32>, Option<u32>)> = (1..=12).map(|i| (Some(i), Some(1))).collect();
        let local = episodes(&layout);
        let ReconcileOutcome::Paired(rec) = reconcile_episodes(&local, 8, true) else {
            panic!("expected pairing");
        };
        assert_eq!(rec.pairs.len(), 8);
        assert!(rec.provider_short);
    }

    #[test]
    fn missing_and_out_of_range_indices_are_skipped() {
        // Absolute numbering (13..) on a 3-episode provider listing.
        let local = episodes(&[(Some(1), Some(1)), (None, Some(1)), (Some(13), Some(1))]);
        let ReconcileOutcome::Paired(rec) = reconcile_episodes(&local, 3, false) else {
            panic!("expected pairing");
        };
        assert_eq!(rec.pairs, vec![EpisodePair { local: 0, remote: 0 }]);
        assert_eq!(rec.skipped.len(), 2);
        assert!(rec
            .skipped
            .iter()
            .any(|(i, r)| *i == 1 && *r == SkipReason::MissingIndex));
        assert!(rec.skipped.iter().any(|(i, r)| *i == 2
            && *r
                == SkipReason::IndexBeyondProvider {
                    index: 13,
                    provider_count: 3
                }));
    }

    // -- state machine -------------------------------------------------------

    #[test]
    fn state_transitions() {
        use MatchState::*;
        assert!(Unmatched.can_transition_to(&Searching));
        assert!(Searching.can_transition_to(&Resolved("1".into())));
        assert!(Resolved("1".into()).can_transition_to(&EpisodesPaired(3)));
        assert!(EpisodesPaired(3).can_transition_to(&CommentsFetched(3)));
        assert!(Searching.can_transition_to(&Failed("x".into())));
        assert!(!CommentsFetched(1).can_transition_to(&Failed("x".into())));
        assert!(!Unmatched.can_transition_to(&CommentsFetched(1)));
        assert!(CommentsFetched(1).is_terminal());
        assert!(!CommentsFetched(0).is_fetched());
    }

    #[test]
    fn match_pass_ends_in_terminal_state() {
        let mut pass = MatchPass::new("dandan", EntityId::new());
        pass.advance(MatchState::Searching);
        assert_eq!(pass.state(), &MatchState::Searching);
        assert_eq!(pass.fail("no hit"), MatchState::Failed("no hit".into()));
    }
}

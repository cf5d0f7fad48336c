//! Denormalized game documents.
//!
//! A [`GameAggregate`] is a pure function of the mirrored entities: the raw game's
//! scalars are copied as-is, every relation field is replaced by snapshots of the
//! referenced records (in the raw game's order) and game-to-game relations stay raw
//! ids so one aggregate never embeds another.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

use super::document::{ref_id, ref_ids, ExternalId};
use super::kinds::EntityKind;
use super::resolver::Resolver;
use crate::error::{SyncError, SyncResult};

/// Scalars copied verbatim from the raw game.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameScalars {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storyline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregated_rating: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregated_rating_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_rating: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_rating_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hypes: Option<u64>,
    /// Unix seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_release_date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Declares the relation fields of a game. Each line produces one struct field; ids
/// of every field are gathered per entity type before anything is resolved:
/// - `many`: reference list, embedded as snapshots in raw order;
/// - `one`: single reference, embedded as a snapshot;
/// - `game_lists` / `game_refs`: references to other games, kept as raw ids.
macro_rules! game_relations {
    (
        many { $($many:ident => $many_kind:ident),* $(,)? }
        one { $($one:ident => $one_kind:ident),* $(,)? }
        game_lists { $($glist:ident),* $(,)? }
        game_refs { $($gref:ident),* $(,)? }
    ) => {
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        #[serde(default)]
        pub struct GameRelations {
            $(
                #[serde(skip_serializing_if = "Vec::is_empty")]
                pub $many: Vec<Value>,
            )*
            $(
                #[serde(skip_serializing_if = "Option::is_none")]
                pub $one: Option<Value>,
            )*
            $(
                #[serde(skip_serializing_if = "Vec::is_empty")]
                pub $glist: Vec<u64>,
            )*
            $(
                #[serde(skip_serializing_if = "Option::is_none")]
                pub $gref: Option<u64>,
            )*
        }

        impl GameRelations {
            /// One resolver call per entity type, covering every field of that type;
            /// the first failure aborts.
            async fn resolve(resolver: &Resolver, raw: &Value) -> SyncResult<Self> {
                let mut wanted: BTreeMap<EntityKind, Vec<u64>> = BTreeMap::new();
                $(
                    wanted
                        .entry(EntityKind::$many_kind)
                        .or_default()
                        .extend(ref_ids(raw.get(stringify!($many))));
                )*
                $(
                    wanted
                        .entry(EntityKind::$one_kind)
                        .or_default()
                        .extend(raw.get(stringify!($one)).and_then(ref_id));
                )*

                let mut found: HashMap<EntityKind, HashMap<u64, Value>> = HashMap::with_capacity(wanted.len());
                for (kind, ids) in wanted {
                    found.insert(kind, resolver.resolve(kind, &ids).await?);
                }

                Ok(Self {
                    $(
                        $many: embed_list(
                            found.get(&EntityKind::$many_kind),
                            &ref_ids(raw.get(stringify!($many))),
                        ),
                    )*
                    $(
                        $one: embed_one(
                            found.get(&EntityKind::$one_kind),
                            raw.get(stringify!($one)).and_then(ref_id),
                        ),
                    )*
                    $(
                        $glist: ref_ids(raw.get(stringify!($glist))),
                    )*
                    $(
                        $gref: raw.get(stringify!($gref)).and_then(ref_id).filter(|id| *id != 0),
                    )*
                })
            }
        }
    };
}

/// Snapshots for `ids` in raw order; repeats and unresolved ids are dropped.
fn embed_list(found: Option<&HashMap<u64, Value>>, ids: &[u64]) -> Vec<Value> {
    let Some(found) = found else {
        return Vec::new();
    };
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter()
        .filter(|id| seen.insert(**id))
        .filter_map(|id| found.get(id).cloned())
        .collect()
}

fn embed_one(found: Option<&HashMap<u64, Value>>, id: Option<u64>) -> Option<Value> {
    found?.get(&id?).cloned()
}

game_relations! {
    many {
        age_ratings => AgeRating,
        alternative_names => AlternativeName,
        artworks => Artwork,
        collections => Collection,
        external_games => ExternalGame,
        franchises => Franchise,
        game_engines => GameEngine,
        game_localizations => GameLocalization,
        game_modes => GameMode,
        genres => Genre,
        involved_companies => InvolvedCompany,
        keywords => Keyword,
        language_supports => LanguageSupport,
        multiplayer_modes => MultiplayerMode,
        platforms => Platform,
        player_perspectives => PlayerPerspective,
        release_dates => ReleaseDate,
        screenshots => Screenshot,
        themes => Theme,
        videos => GameVideo,
        websites => Website,
    }
    one {
        cover => Cover,
        franchise => Franchise,
        game_status => GameStatus,
        game_type => GameType,
    }
    game_lists {
        bundles,
        dlcs,
        expansions,
        expanded_games,
        forks,
        ports,
        remakes,
        remasters,
        similar_games,
        standalone_expansions,
    }
    game_refs {
        parent_game,
        version_parent,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameAggregate {
    pub id: u64,
    #[serde(flatten)]
    pub scalars: GameScalars,
    #[serde(flatten)]
    pub relations: GameRelations,
    /// Primary name followed by every resolved alternative name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all_names: Vec<String>,
}

impl GameAggregate {
    pub fn name(&self) -> Option<&str> {
        self.scalars.name.as_deref()
    }
}

/// Builds the aggregate for one raw game. Nothing is written to the aggregate store
/// here; any resolution failure aborts the whole build.
pub async fn aggregate(resolver: &Resolver, raw: &Value) -> SyncResult<GameAggregate> {
    let id = raw
        .external_id()
        .ok_or_else(|| SyncError::validation("raw game without an id"))?;
    let scalars: GameScalars = serde_json::from_value(raw.clone())
        .map_err(|err| SyncError::validation(format!("game {id} has malformed scalars: {err}")))?;
    let relations = GameRelations::resolve(resolver, raw).await?;

    let all_names = scalars
        .name
        .iter()
        .cloned()
        .chain(
            relations
                .alternative_names
                .iter()
                .filter_map(|alt| alt.get("name").and_then(Value::as_str).map(str::to_owned)),
        )
        .collect();

    debug!(target = "igdb", game_id = id, "aggregated game");
    Ok(GameAggregate {
        id,
        scalars,
        relations,
        all_names,
    })
}

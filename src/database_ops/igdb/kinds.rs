use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::document::ref_id;

macro_rules! entity_kinds {
    ($($variant:ident => $endpoint:literal),+ $(,)?) => {
        /// Every IGDB collection mirrored locally. The endpoint name doubles as the
        /// local collection name.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum EntityKind {
            $($variant),+
        }

        impl EntityKind {
            pub const ALL: &'static [EntityKind] = &[$(EntityKind::$variant),+];

            pub const fn endpoint(self) -> &'static str {
                match self {
                    $(EntityKind::$variant => $endpoint),+
                }
            }
        }
    };
}

entity_kinds! {
    AgeRatingCategory => "age_rating_categories",
    AgeRatingContentDescription => "age_rating_content_descriptions",
    AgeRatingContentDescriptionV2 => "age_rating_content_descriptions_v2",
    AgeRatingOrganization => "age_rating_organizations",
    AgeRating => "age_ratings",
    AlternativeName => "alternative_names",
    Artwork => "artworks",
    CharacterGender => "character_genders",
    CharacterMugShot => "character_mug_shots",
    Character => "characters",
    CharacterSpecies => "character_species",
    CollectionMembership => "collection_memberships",
    CollectionMembershipType => "collection_membership_types",
    CollectionRelation => "collection_relations",
    CollectionRelationType => "collection_relation_types",
    Collection => "collections",
    CollectionType => "collection_types",
    Company => "companies",
    CompanyLogo => "company_logos",
    CompanyStatus => "company_statuses",
    CompanyWebsite => "company_websites",
    Cover => "covers",
    DateFormat => "date_formats",
    EventLogo => "event_logos",
    EventNetwork => "event_networks",
    Event => "events",
    ExternalGame => "external_games",
    ExternalGameSource => "external_game_sources",
    Franchise => "franchises",
    GameEngineLogo => "game_engine_logos",
    GameEngine => "game_engines",
    GameLocalization => "game_localizations",
    GameMode => "game_modes",
    GameReleaseFormat => "game_release_formats",
    GameStatus => "game_statuses",
    GameTimeToBeat => "game_time_to_beats",
    GameType => "game_types",
    GameVersionFeature => "game_version_features",
    GameVersionFeatureValue => "game_version_feature_values",
    GameVersion => "game_versions",
    GameVideo => "game_videos",
    Genre => "genres",
    InvolvedCompany => "involved_companies",
    Keyword => "keywords",
    Language => "languages",
    LanguageSupport => "language_supports",
    LanguageSupportType => "language_support_types",
    MultiplayerMode => "multiplayer_modes",
    NetworkType => "network_types",
    PlatformFamily => "platform_families",
    PlatformLogo => "platform_logos",
    Platform => "platforms",
    PlatformType => "platform_types",
    PlatformVersionCompany => "platform_version_companies",
    PlatformVersionReleaseDate => "platform_version_release_dates",
    PlatformVersion => "platform_versions",
    PlatformWebsite => "platform_websites",
    PlayerPerspective => "player_perspectives",
    PopularityPrimitive => "popularity_primitives",
    PopularityType => "popularity_types",
    Region => "regions",
    ReleaseDateRegion => "release_date_regions",
    ReleaseDate => "release_dates",
    ReleaseDateStatus => "release_date_statuses",
    Screenshot => "screenshots",
    Theme => "themes",
    Website => "websites",
    WebsiteType => "website_types",
    Game => "games",
}

impl EntityKind {
    pub fn is_game(self) -> bool {
        self == EntityKind::Game
    }

    /// Field on the body that points back at the owning game, if this kind has one.
    pub const fn owning_game_field(self) -> Option<&'static str> {
        use EntityKind::*;
        match self {
            AlternativeName | Artwork | CollectionMembership | Cover | ExternalGame
            | GameLocalization | GameVersion | GameVersionFeatureValue | GameVideo
            | InvolvedCompany | LanguageSupport | MultiplayerMode | ReleaseDate | Screenshot
            | Website => Some("game"),
            GameTimeToBeat | PopularityPrimitive => Some("game_id"),
            _ => None,
        }
    }

    /// Owning game id read from `body`; accepts a bare id or an expanded `{ "id": .. }`.
    pub fn owning_game_id(self, body: &Value) -> Option<u64> {
        let field = self.owning_game_field()?;
        body.get(field).and_then(ref_id).filter(|id| *id != 0)
    }

    /// Upstream does not publish change notifications for popularity primitives.
    pub fn accepts_webhooks(self) -> bool {
        self != EntityKind::PopularityPrimitive
    }

    /// Bulk-sync order: every referenced collection first, games last.
    pub fn sync_order() -> impl Iterator<Item = EntityKind> {
        Self::ALL
            .iter()
            .copied()
            .filter(|k| !k.is_game())
            .chain(std::iter::once(EntityKind::Game))
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.endpoint())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownKind(pub String);

impl fmt::Display for UnknownKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown IGDB endpoint '{}'", self.0)
    }
}

impl std::error::Error for UnknownKind {}

impl FromStr for EntityKind {
    type Err = UnknownKind;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let wanted = raw.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.endpoint() == wanted)
            .ok_or_else(|| UnknownKind(wanted.to_string()))
    }
}

impl Serialize for EntityKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.endpoint())
    }
}

impl<'de> Deserialize<'de> for EntityKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

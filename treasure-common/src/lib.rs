// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{collections::HashSet, sync::LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type RouteId = String;

/// Marker position on the adventure map, in percent of the map's width/height.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    pub route_id: RouteId,
    pub name: String,
    pub description: String,
    pub points: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
    pub position: Position,
}

/// Seed row for the progress store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoutePoints {
    pub route_id: RouteId,
    pub points: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RouteProgress {
    pub route_id: RouteId,
    pub visited: bool,
    pub points: u32,
    pub visited_at: Option<DateTime<Utc>>,
}

impl RouteProgress {
    pub fn unvisited(route_id: impl Into<RouteId>, points: u32) -> Self {
        Self {
            route_id: route_id.into(),
            visited: false,
            points,
            visited_at: None,
        }
    }

    /// `visited` and `visited_at` must agree: both set or both clear.
    pub fn is_consistent(&self) -> bool {
        self.visited == self.visited_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    pub total_points: u64,
    pub visited_routes: usize,
    pub total_routes: usize,
    pub routes: Vec<RouteProgress>,
    pub completed: bool,
}

impl GameState {
    /// Derive the aggregate snapshot from the full list of progress rows.
    pub fn from_routes(routes: Vec<RouteProgress>) -> Self {
        let (visited_routes, total_points) = routes
            .iter()
            .filter(|route| route.visited)
            .fold((0_usize, 0_u64), |(count, sum), route| {
                (count + 1, sum + u64::from(route.points))
            });
        let total_routes = routes.len();

        Self {
            total_points,
            visited_routes,
            total_routes,
            routes,
            completed: visited_routes == total_routes,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitRequest {
    #[serde(default)]
    pub route_id: Option<RouteId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitResponse {
    pub success: bool,
    pub points: u32,
    pub state: GameState,
}

/// Body returned with 409 when a route had already been credited.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlreadyVisitedResponse {
    pub error: String,
    pub already_visited: bool,
    pub route_id: RouteId,
    pub points: u32,
    pub state: GameState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetResponse {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("route catalog is empty")]
    Empty,
    #[error("duplicate route id {0} in catalog")]
    DuplicateRouteId(RouteId),
    #[error("route id must not be blank")]
    BlankRouteId,
}

/// Read-only list of treasure routes, in catalog order.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteCatalog {
    routes: Vec<RouteConfig>,
}

impl RouteCatalog {
    pub fn new(routes: Vec<RouteConfig>) -> Result<Self, CatalogError> {
        if routes.is_empty() {
            return Err(CatalogError::Empty);
        }

        let mut seen = HashSet::new();
        for route in &routes {
            if route.route_id.trim().is_empty() {
                return Err(CatalogError::BlankRouteId);
            }
            if !seen.insert(route.route_id.as_str()) {
                return Err(CatalogError::DuplicateRouteId(route.route_id.clone()));
            }
        }

        Ok(Self { routes })
    }

    pub fn routes(&self) -> &[RouteConfig] {
        &self.routes
    }

    /// Never zero; `new` rejects an empty list.
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn get_route_by_id(&self, route_id: &str) -> Option<&RouteConfig> {
        self.routes.iter().find(|route| route.route_id == route_id)
    }

    pub fn all_route_ids(&self) -> Vec<RouteId> {
        self.routes
            .iter()
            .map(|route| route.route_id.clone())
            .collect()
    }

    pub fn route_points(&self) -> Vec<RoutePoints> {
        self.routes
            .iter()
            .map(|route| RoutePoints {
                route_id: route.route_id.clone(),
                points: route.points,
            })
            .collect()
    }

    pub fn total_points(&self) -> u64 {
        self.routes
            .iter()
            .map(|route| u64::from(route.points))
            .sum()
    }
}

impl Default for RouteCatalog {
    fn default() -> Self {
        Self {
            routes: default_routes(),
        }
    }
}

fn route(route_id: &str, name: &str, description: &str, points: u32, x: f64, y: f64) -> RouteConfig {
    RouteConfig {
        route_id: route_id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        points,
        image: None,
        help: None,
        position: Position { x, y },
    }
}

/// The routes hidden around the venue for the production game.
pub fn default_routes() -> Vec<RouteConfig> {
    vec![
        route(
            "ancient-temple-ruins",
            "Energetický chrám",
            "Doufám, že se ti nemotá hlava z řídkého vzduchu. Výš při hledání pokladů už pravdepodobně nevystoupáš. Trochu si odpočiň a popadni dech, tahle výzva nebyla snadná. Ale odměna stojí za to!",
            800,
            4.0,
            57.0,
        ),
        route(
            "forbidden-crystal-cave",
            "Kamenná jeskyně",
            "Legenda praví, že tento kámen pochází ze staré čínské zdi. Snad jim tam nebude chybět. Tobě posloužil k získání pokladu Kamenné jeskyně a potvrzení starého českého přísloví: Není kámen, který leží nadarmo.",
            200,
            62.0,
            54.0,
        ),
        route(
            "lost-city-of-gold",
            "Botanická zahrada",
            "Překonal jsi liány, masožravky a podivný hmyz kolem zarostlé botanické zahrady a získal poklad. Vyměň tričko (a trenky?) a pokračuj dál!",
            300,
            12.0,
            97.0,
        ),
        route(
            "mysterious-jungle-path",
            "Modlitební místo",
            "Haleluja! Tohle byla opravdová zkouška, mít před sebou všechny ty staré svazky plné moudrosti, kdekdo by se začetl na desítky let. Ale ty jsi odolal, ukazuješ opravdovou sílu ducha! A protože církev je samé zlato, tento poklad budeš mít problém unést!",
            1600,
            52.0,
            95.0,
        ),
        route(
            "hidden-treasure-vault",
            "Dřevěná bašta",
            "Ovládl jsi Dřevěnou baštu! Doufám, že jsi přitom nevyházel polovinu poliček. Na oplátku jsi našel slušný počet mincí, jen tak dál!",
            600,
            92.0,
            73.0,
        ),
        RouteConfig {
            image: Some("/electric-mountains.webp".to_string()),
            ..route(
                "sacred-mountain-peak",
                "Elektrizující hory",
                "Tady šlo opravdu o krk! Jistá smrt na dosah ruky a zachovals chladnou hlavu. Vystoupal jsi na vrchol a našel zaslouženou odměnu. Jdeš příkladem všem dobrodruhům! A teď ukliď ty schůdky.",
                300,
                47.0,
                50.0,
            )
        },
        RouteConfig {
            image: Some("/waterfalls.webp".to_string()),
            help: Some("Kde voda zurčí a klokotá".to_string()),
            ..route(
                "desert-oasis-secret",
                "Posvátné vodopády",
                "Dobrá práce! Našel jsi poklad ukrytý pod zurčícími vodopády a keramickou bání. Tenhle poklad ukryli bájni Odpadníci pověstní svou důmyslností. Najít ho určitě nebylo snadné. Snad kolena pořád slouží!",
                1000,
                62.5,
                9.0,
            )
        },
        route(
            "underwater-archaeological-site",
            "Arktické pláně",
            "Gratuluji dobrodruhu! Překonal jsi magnetické nástrahy i nostalgii a nalezl ukrytý poklad. Snad ti přitom neumrzly prsty!",
            200,
            96.0,
            21.0,
        ),
    ]
}

pub fn default_catalog() -> RouteCatalog {
    RouteCatalog::default()
}

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is a valid regex")
});

/// Replace `${VAR_NAME}` patterns in a string with values from environment variables.
/// Unknown or unset variables are replaced with an empty string.
pub fn expand_env_vars(input: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_default()
        })
        .into_owned()
}

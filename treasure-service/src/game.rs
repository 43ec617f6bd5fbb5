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

//! Visit/reset state machine over the progress store.
//!
//! Each route moves `UNVISITED -> VISITED` at most once per reset cycle.

use std::collections::BTreeSet;

use anyhow::Context;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};
use treasure_common::{GameState, RouteCatalog, RouteId};

use crate::store::{BootstrapOutcome, ProgressStore, encode_timestamp};

/// Misc-state key holding the time the last route of the cycle was credited.
pub const COMPLETED_AT_KEY: &str = "completed_at";

#[derive(Debug, Error)]
pub enum VisitError {
    #[error("route {0} not found")]
    RouteNotFound(RouteId),
    /// Expected outcome for duplicate scans and lost races; not a defect.
    #[error("route {route_id} already visited")]
    AlreadyVisited { route_id: RouteId, points: u32 },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitOutcome {
    pub route_id: RouteId,
    pub points: u32,
    pub visited_at: DateTime<Utc>,
}

/// Seed the store from the catalog if it is empty, then report drift between
/// the stored routes and the catalog.
pub async fn bootstrap(
    store: &dyn ProgressStore,
    catalog: &RouteCatalog,
) -> anyhow::Result<BootstrapOutcome> {
    let outcome = store
        .bootstrap(&catalog.route_points())
        .await
        .context("failed to bootstrap progress store")?;

    match outcome {
        BootstrapOutcome::Seeded { routes } => {
            info!(routes, "initialized route progress from catalog");
        }
        BootstrapOutcome::AlreadyInitialized { routes } => {
            let stored: BTreeSet<RouteId> = store
                .get_all()
                .await
                .context("failed to list stored routes")?
                .into_iter()
                .map(|route| route.route_id)
                .collect();
            let cataloged: BTreeSet<RouteId> = catalog.all_route_ids().into_iter().collect();

            let missing: Vec<&RouteId> = cataloged.difference(&stored).collect();
            let unknown: Vec<&RouteId> = stored.difference(&cataloged).collect();
            if !missing.is_empty() || !unknown.is_empty() {
                warn!(
                    ?missing,
                    ?unknown,
                    "stored routes differ from catalog; store is only seeded when empty"
                );
            }
            info!(routes, "route progress already initialized");
        }
    }

    Ok(outcome)
}

pub async fn get_state(store: &dyn ProgressStore) -> anyhow::Result<GameState> {
    let routes = store
        .get_all()
        .await
        .context("failed to load route progress")?;
    Ok(GameState::from_routes(routes))
}

pub async fn visit(store: &dyn ProgressStore, route_id: &str) -> Result<VisitOutcome, VisitError> {
    let route = store
        .get_by_route_id(route_id)
        .await?
        .ok_or_else(|| VisitError::RouteNotFound(route_id.to_string()))?;

    if route.visited {
        return Err(VisitError::AlreadyVisited {
            route_id: route.route_id,
            points: route.points,
        });
    }

    let visited_at = Utc::now();
    let changed = store.mark_visited(route_id, visited_at).await?;
    if changed == 0 {
        info!(route_id = %route_id, "concurrent visit already credited route");
        return Err(VisitError::AlreadyVisited {
            route_id: route.route_id,
            points: route.points,
        });
    }

    // The write is committed; a failed confirmation is reported but never
    // turns the success into an error.
    match store.get_by_route_id(route_id).await {
        Ok(Some(confirmed)) if confirmed.visited && confirmed.is_consistent() => {}
        Ok(confirmed) => {
            let visited = confirmed.as_ref().map(|route| route.visited);
            let visited_at = confirmed.and_then(|route| route.visited_at);
            warn!(
                route_id = %route_id,
                ?visited,
                ?visited_at,
                "visit did not read back as persisted"
            );
        }
        Err(error) => {
            warn!(
                route_id = %route_id,
                error = %format!("{error:#}"),
                "failed to confirm visit"
            );
        }
    }

    info!(route_id = %route_id, points = route.points, "route visited");
    Ok(VisitOutcome {
        route_id: route.route_id,
        points: route.points,
        visited_at,
    })
}

pub async fn reset(store: &dyn ProgressStore) -> anyhow::Result<()> {
    store
        .reset_all()
        .await
        .context("failed to reset game progress")?;
    info!("game progress reset");
    Ok(())
}

/// Stamp the completion time once per cycle. Returns `true` only for the call
/// that recorded it. The stamp is refused if a reset reopened any route after
/// `state` was read.
pub async fn record_completion(
    store: &dyn ProgressStore,
    state: &GameState,
    at: DateTime<Utc>,
) -> anyhow::Result<bool> {
    if !state.completed {
        return Ok(false);
    }

    let recorded = store
        .put_misc_if_all_visited(COMPLETED_AT_KEY, &encode_timestamp(at))
        .await
        .context("failed to record game completion")?;
    if recorded {
        info!(total_points = state.total_points, "all routes visited");
    }
    Ok(recorded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteProgressStore;
    use async_trait::async_trait;
    use std::sync::Arc;
    use treasure_common::{Position, RouteConfig, RoutePoints, RouteProgress};

    fn two_route_catalog() -> RouteCatalog {
        let route = |route_id: &str, points: u32| RouteConfig {
            route_id: route_id.to_string(),
            name: route_id.to_uppercase(),
            description: String::new(),
            points,
            image: None,
            help: None,
            position: Position { x: 0.0, y: 0.0 },
        };
        RouteCatalog::new(vec![route("a", 100), route("b", 250)]).unwrap()
    }

    async fn seeded_store() -> SqliteProgressStore {
        let store = SqliteProgressStore::open_in_memory().unwrap();
        bootstrap(&store, &two_route_catalog()).await.unwrap();
        store
    }

    fn assert_invariants(state: &GameState) {
        assert!(state.routes.iter().all(|route| route.is_consistent()));
        let visited_sum: u64 = state
            .routes
            .iter()
            .filter(|route| route.visited)
            .map(|route| u64::from(route.points))
            .sum();
        assert_eq!(visited_sum, state.total_points);
        assert!(state.visited_routes <= state.total_routes);
    }

    #[tokio::test]
    async fn two_route_walkthrough() {
        let store = seeded_store().await;

        let state = get_state(&store).await.unwrap();
        assert_eq!(
            (state.total_points, state.visited_routes, state.total_routes, state.completed),
            (0, 0, 2, false)
        );

        let visit_a = visit(&store, "a").await.unwrap();
        assert_eq!(visit_a.points, 100);
        let state = get_state(&store).await.unwrap();
        assert_eq!((state.total_points, state.visited_routes, state.completed), (100, 1, false));
        assert_invariants(&state);

        let visit_b = visit(&store, "b").await.unwrap();
        assert_eq!(visit_b.points, 250);
        let state = get_state(&store).await.unwrap();
        assert_eq!((state.total_points, state.visited_routes, state.completed), (350, 2, true));
        assert_invariants(&state);

        let again = visit(&store, "a").await.unwrap_err();
        assert!(matches!(
            again,
            VisitError::AlreadyVisited { ref route_id, points: 100 } if route_id == "a"
        ));
        assert_eq!(get_state(&store).await.unwrap(), state);

        reset(&store).await.unwrap();
        let state = get_state(&store).await.unwrap();
        assert_eq!((state.total_points, state.visited_routes, state.completed), (0, 0, false));
        assert_invariants(&state);
    }

    #[tokio::test]
    async fn visit_unknown_route_leaves_store_untouched() {
        let store = seeded_store().await;
        let before = get_state(&store).await.unwrap();

        let err = visit(&store, "no-such-route").await.unwrap_err();
        assert!(matches!(err, VisitError::RouteNotFound(ref id) if id == "no-such-route"));
        assert_eq!(get_state(&store).await.unwrap(), before);
    }

    #[tokio::test]
    async fn visit_records_timestamp_once() {
        let store = seeded_store().await;
        visit(&store, "b").await.unwrap();
        let first = store.get_by_route_id("b").await.unwrap().unwrap().visited_at;

        assert!(visit(&store, "b").await.is_err());
        let second = store.get_by_route_id("b").await.unwrap().unwrap().visited_at;
        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_visits_credit_exactly_once() {
        let store = Arc::new(seeded_store().await);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { visit(store.as_ref(), "a").await })
            })
            .collect();

        let mut successes = 0;
        let mut already_visited = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(outcome) => {
                    assert_eq!(outcome.points, 100);
                    successes += 1;
                }
                Err(VisitError::AlreadyVisited { points, .. }) => {
                    assert_eq!(points, 100);
                    already_visited += 1;
                }
                Err(other) => panic!("unexpected visit error: {other}"),
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(already_visited, 15);

        let state = get_state(store.as_ref()).await.unwrap();
        assert_eq!(state.total_points, 100);
        assert_invariants(&state);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_visits_to_different_routes_all_succeed() {
        let store = Arc::new(seeded_store().await);
        let a = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { visit(store.as_ref(), "a").await })
        };
        let b = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { visit(store.as_ref(), "b").await })
        };

        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
        assert!(get_state(store.as_ref()).await.unwrap().completed);
    }

    #[tokio::test]
    async fn completion_is_recorded_once_and_cleared_by_reset() {
        let store = seeded_store().await;
        let now = Utc::now();

        visit(&store, "a").await.unwrap();
        let partial = get_state(&store).await.unwrap();
        assert!(!record_completion(&store, &partial, now).await.unwrap());

        visit(&store, "b").await.unwrap();
        let done = get_state(&store).await.unwrap();
        assert!(record_completion(&store, &done, now).await.unwrap());
        assert!(!record_completion(&store, &done, Utc::now()).await.unwrap());
        assert_eq!(
            store.misc_value(COMPLETED_AT_KEY).await.unwrap(),
            Some(encode_timestamp(now))
        );

        reset(&store).await.unwrap();
        assert!(store.misc_value(COMPLETED_AT_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bootstrap_keeps_existing_progress() {
        let store = seeded_store().await;
        visit(&store, "a").await.unwrap();

        let outcome = bootstrap(&store, &two_route_catalog()).await.unwrap();
        assert_eq!(outcome, BootstrapOutcome::AlreadyInitialized { routes: 2 });
        assert_eq!(get_state(&store).await.unwrap().total_points, 100);
    }

    /// Runs a reset immediately before the completion stamp is written.
    struct ResetBeforeStamp {
        inner: SqliteProgressStore,
    }

    #[async_trait]
    impl ProgressStore for ResetBeforeStamp {
        async fn bootstrap(&self, seed: &[RoutePoints]) -> anyhow::Result<BootstrapOutcome> {
            self.inner.bootstrap(seed).await
        }

        async fn get_all(&self) -> anyhow::Result<Vec<RouteProgress>> {
            self.inner.get_all().await
        }

        async fn get_by_route_id(&self, route_id: &str) -> anyhow::Result<Option<RouteProgress>> {
            self.inner.get_by_route_id(route_id).await
        }

        async fn mark_visited(
            &self,
            route_id: &str,
            visited_at: DateTime<Utc>,
        ) -> anyhow::Result<usize> {
            self.inner.mark_visited(route_id, visited_at).await
        }

        async fn reset_all(&self) -> anyhow::Result<()> {
            self.inner.reset_all().await
        }

        async fn put_misc_if_all_visited(&self, key: &str, value: &str) -> anyhow::Result<bool> {
            self.inner.reset_all().await?;
            self.inner.put_misc_if_all_visited(key, value).await
        }
    }

    #[tokio::test]
    async fn completion_is_not_stamped_after_an_intervening_reset() {
        let store = ResetBeforeStamp {
            inner: seeded_store().await,
        };
        visit(&store, "a").await.unwrap();
        visit(&store, "b").await.unwrap();
        let done = get_state(&store).await.unwrap();
        assert!(done.completed);

        assert!(!record_completion(&store, &done, Utc::now()).await.unwrap());
        assert!(store.inner.misc_value(COMPLETED_AT_KEY).await.unwrap().is_none());
        assert_eq!(get_state(&store).await.unwrap().visited_routes, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn visits_racing_a_reset_keep_state_consistent() {
        let store = Arc::new(seeded_store().await);

        for _ in 0..20 {
            let visits: Vec<_> = ["a", "b"]
                .into_iter()
                .map(|route_id| {
                    let store = Arc::clone(&store);
                    tokio::spawn(async move {
                        let outcome = visit(store.as_ref(), route_id).await;
                        if outcome.is_ok() {
                            let state = get_state(store.as_ref()).await?;
                            record_completion(store.as_ref(), &state, Utc::now()).await?;
                        }
                        anyhow::Ok(())
                    })
                })
                .collect();
            let resetter = {
                let store = Arc::clone(&store);
                tokio::spawn(async move { reset(store.as_ref()).await })
            };

            for handle in visits {
                handle.await.unwrap().unwrap();
            }
            resetter.await.unwrap().unwrap();

            let state = get_state(store.as_ref()).await.unwrap();
            assert_invariants(&state);
            if store.misc_value(COMPLETED_AT_KEY).await.unwrap().is_some() {
                assert!(state.completed);
            }

            reset(store.as_ref()).await.unwrap();
        }
    }
}

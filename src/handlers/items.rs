//! Small in-memory API served by the demo binary so there is live traffic
//! and something to probe.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::probe::{EndpointInfo, ProbePayload, StaticCatalog};

use super::ApiError;

/// How long `/api/slow` sleeps before answering.
pub const SLOW_DELAY: Duration = Duration::from_millis(1_200);

// ─── Domain type ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: u64,
    pub name: String,
    /// Price in cents (e.g. 12999 = $129.99)
    pub price: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct NewItem {
    pub name: String,
    #[serde(default)]
    pub price: u64,
}

#[derive(Default)]
pub struct ItemStore {
    items: Mutex<BTreeMap<u64, Item>>,
    next_id: AtomicU64,
    flaky_calls: AtomicU64,
}

impl ItemStore {
    /// Store seeded with a few items so `GET /api/items/1` resolves.
    pub fn seeded() -> Self {
        let store = Self::default();
        for (name, price) in [("Widget", 1_999), ("Gadget", 4_550), ("Gizmo", 12_999)] {
            store.insert(NewItem {
                name: name.into(),
                price,
            });
        }
        store
    }

    fn insert(&self, new: NewItem) -> Item {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let item = Item {
            id,
            name: new.name,
            price: new.price,
            created_at: Utc::now(),
        };
        self.items.lock().insert(id, item.clone());
        item
    }
}

pub fn router(store: Arc<ItemStore>) -> Router {
    Router::new()
        .route("/api/items", get(list_items).post(create_item))
        .route("/api/items/:id", get(get_item))
        .route("/api/slow", get(slow))
        .route("/api/flaky", get(flaky))
        .with_state(store)
}

/// Catalogue the demo routes with payloads that make them probe-able.
pub fn register(catalog: &StaticCatalog) {
    catalog.register(
        EndpointInfo::new("GET", "/api/items").with_summary("List items"),
        None,
    );

    let create = ProbePayload {
        body: Some(json!({ "name": "probe item", "price": 100 })),
        ..Default::default()
    };
    catalog.register(
        EndpointInfo::new("POST", "/api/items")
            .with_body("application/json")
            .with_summary("Create an item"),
        Some(create),
    );

    let mut fetch = ProbePayload::default();
    fetch.path_params.insert("id".into(), json!(1));
    catalog.register(
        EndpointInfo::new("GET", "/api/items/:id").with_summary("Fetch one item"),
        Some(fetch),
    );

    catalog.register(
        EndpointInfo::new("GET", "/api/slow").with_summary("Answers after a delay"),
        None,
    );
    catalog.register(
        EndpointInfo::new("GET", "/api/flaky").with_summary("Fails every other call"),
        None,
    );
}

// ─── GET /api/items ──────────────────────────────────────────────

async fn list_items(State(store): State<Arc<ItemStore>>) -> Json<Vec<Item>> {
    Json(store.items.lock().values().cloned().collect())
}

// ─── POST /api/items ─────────────────────────────────────────────

async fn create_item(
    State(store): State<Arc<ItemStore>>,
    Json(new): Json<NewItem>,
) -> Result<(StatusCode, Json<Item>), ApiError> {
    if new.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".into()));
    }
    Ok((StatusCode::CREATED, Json(store.insert(new))))
}

// ─── GET /api/items/:id ──────────────────────────────────────────

async fn get_item(
    State(store): State<Arc<ItemStore>>,
    Path(id): Path<u64>,
) -> Result<Json<Item>, ApiError> {
    store
        .items
        .lock()
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("item '{id}' not found")))
}

// ─── GET /api/slow ───────────────────────────────────────────────

async fn slow() -> Json<serde_json::Value> {
    tokio::time::sleep(SLOW_DELAY).await;
    Json(json!({ "delayed_ms": SLOW_DELAY.as_millis() as u64 }))
}

// ─── GET /api/flaky ──────────────────────────────────────────────

async fn flaky(State(store): State<Arc<ItemStore>>) -> (StatusCode, Json<serde_json::Value>) {
    let call = store.flaky_calls.fetch_add(1, Ordering::Relaxed);
    if call % 2 == 1 {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "flaky failure", "call": call })),
        )
    } else {
        (StatusCode::OK, Json(json!({ "ok": true, "call": call })))
    }
}

//! Dictionary loading for the transformer's synthesis rules.
//!
//! Statuses, couriers, and warehouses are small upstream dictionaries. The
//! orchestrator loads them once per run (only when a selected field needs
//! them) and hands the result to the transformer, which never performs I/O.

use rex_core::{value, Dictionaries, EngineError, UpstreamApi, Value};
use serde_json::Map;
use tracing::debug;

/// Which dictionaries a run needs, derived from the selected fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DictionaryNeeds {
    pub statuses: bool,
    pub couriers: bool,
    pub warehouses: bool,
}

impl DictionaryNeeds {
    pub fn from_selected(selected: &[String]) -> Self {
        let mut needs = Self::default();
        for key in selected {
            match key.as_str() {
                "order_status_name" => needs.statuses = true,
                "courier_name" => needs.couriers = true,
                "warehouse_name" => needs.warehouses = true,
                _ => {}
            }
        }
        needs
    }

    pub fn any(self) -> bool {
        self.statuses || self.couriers || self.warehouses
    }
}

pub async fn load_dictionaries(
    api: &dyn UpstreamApi,
    needs: DictionaryNeeds,
) -> Result<Dictionaries, EngineError> {
    let mut dicts = Dictionaries::default();

    if needs.statuses {
        let body = api
            .call("getOrderStatusList", Value::Object(Map::new()))
            .await?;
        for status in body.get("statuses").and_then(Value::as_array).into_iter().flatten() {
            let Some(id) = status.get("id").and_then(value::as_i64) else { continue };
            let name = status
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            dicts.statuses.insert(id, name.to_string());
        }
    }

    if needs.couriers {
        let body = api.call("getCouriersList", Value::Object(Map::new())).await?;
        for courier in body.get("couriers").and_then(Value::as_array).into_iter().flatten() {
            let Some(code) = courier.get("code").and_then(Value::as_str) else { continue };
            let name = courier
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or(code);
            dicts.couriers.insert(code.to_string(), name.to_string());
        }
    }

    if needs.warehouses {
        let body = api
            .call("getWarehousesList", Value::Object(Map::new()))
            .await?;
        for warehouse in body.get("warehouses").and_then(Value::as_array).into_iter().flatten() {
            let Some(id) = warehouse.get("warehouse_id").and_then(value::as_i64) else {
                continue;
            };
            let name = warehouse
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            dicts.warehouses.insert(id, name.to_string());
        }
    }

    debug!(
        statuses = dicts.statuses.len(),
        couriers = dicts.couriers.len(),
        warehouses = dicts.warehouses.len(),
        "dictionaries loaded"
    );
    Ok(dicts)
}

//! Shared weather-station test domain for the integration suites.
#![allow(dead_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tagfold::{
    DomainTypeRegistry, Event, EventPayload, PayloadType, SortableUniqueId, TagGroup,
    TagMultiProjector, TagProjector, TagStatePayload,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForecastPosted {
    pub temperature_c: i32,
}

impl EventPayload for ForecastPosted {
    const TYPE_NAME: &'static str = "ForecastPosted";
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForecastRemoved;

impl EventPayload for ForecastRemoved {
    const TYPE_NAME: &'static str = "ForecastRemoved";
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Forecast {
    pub temperature_c: i32,
    pub observations: u64,
    pub removed: bool,
}

impl PayloadType for Forecast {
    const TYPE_NAME: &'static str = "Forecast";

    fn is_tombstone(&self) -> bool {
        self.removed
    }
}

pub struct StationGroup;

impl TagGroup for StationGroup {
    const NAME: &'static str = "Station";
    type Key = u32;

    fn key_of(content: &str) -> Option<u32> {
        content.parse().ok()
    }

    fn content_of(key: &u32) -> String {
        key.to_string()
    }
}

pub struct ForecastProjector;

impl TagProjector for ForecastProjector {
    const NAME: &'static str = "ForecastProjector";
    const VERSION: &'static str = "1.0.0";

    fn project(
        current: Option<Box<dyn TagStatePayload>>,
        event: &Event,
    ) -> Box<dyn TagStatePayload> {
        let mut forecast = current
            .and_then(|payload| payload.downcast_ref::<Forecast>().cloned())
            .unwrap_or(Forecast {
                temperature_c: 0,
                observations: 0,
                removed: false,
            });
        if let Some(posted) = event.payload_as::<ForecastPosted>() {
            forecast.temperature_c = posted.temperature_c;
            forecast.observations += 1;
        } else if event.payload_as::<ForecastRemoved>().is_some() {
            forecast.removed = true;
        }
        Box::new(forecast)
    }
}

pub type ForecastProjection = TagMultiProjector<ForecastProjector, StationGroup>;

pub fn registry() -> DomainTypeRegistry {
    let mut registry = DomainTypeRegistry::new();
    registry.register_payload::<Forecast>();
    registry.register_projector(ForecastProjector::NAME, ForecastProjector::VERSION);
    registry
}

/// Route host tracing through the test harness, once per process.
pub fn init_tracing() {
    use std::sync::Once;

    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

pub fn at(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

pub fn posted(secs: u64, station: u32, temperature_c: i32) -> Event {
    Event::new(
        &ForecastPosted { temperature_c },
        vec![format!("Station:{station}")],
        at(secs),
    )
    .unwrap()
}

pub fn removed(secs: u64, station: u32) -> Event {
    Event::new(&ForecastRemoved, vec![format!("Station:{station}")], at(secs)).unwrap()
}

/// An event created `secs_ago` before the wall clock, for live-host tests.
pub fn posted_ago(secs_ago: u64, station: u32, temperature_c: i32) -> Event {
    Event::new(
        &ForecastPosted { temperature_c },
        vec![format!("Station:{station}")],
        SystemTime::now() - Duration::from_secs(secs_ago),
    )
    .unwrap()
}

pub fn threshold(secs: u64) -> SortableUniqueId {
    SortableUniqueId::threshold(at(secs))
}

pub fn temperature(projection: &ForecastProjection, station: u32) -> Option<i32> {
    projection
        .current_items()
        .get(&station)
        .and_then(|state| state.payload.downcast_ref::<Forecast>())
        .map(|forecast| forecast.temperature_c)
}

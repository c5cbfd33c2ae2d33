//! URL → intent, outcome → JSON
//!
//! Paths and body field names are the ones existing bed remotes already call.

use std::sync::Arc;

use embedded_hal::digital::OutputPin;
use hyper::{Method, StatusCode};
use serde_json::{Map, Value, json};

use bedside_ble::{DeviceSession, GattLink, Outcome, SessionError};
use bedside_proto::{DecodeError, Intent, Preset, Reading};

use crate::gpio::RelayController;
use crate::http::{HttpResult, bytes_to_resp, json, json_with_status};

pub const GREETING: &str = "This is my bed controller";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switch {
    On,
    Off,
    Status,
}

impl Switch {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "on" => Some(Switch::On),
            "off" => Some(Switch::Off),
            "status" => Some(Switch::Status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Root,
    Bed(Intent),
    GpioLight(Switch),
    /// A percentage segment that isn't an integer
    BadPercent(String),
    NotFound,
}

/// Which intent a percentage path maps to
fn percent_intent(name: &str) -> Option<fn(i64) -> Intent> {
    Some(match name {
        "moveUpper" => Intent::MoveUpper,
        "moveLower" => Intent::MoveLower,
        "setUpperVib" => Intent::SetUpperVibration,
        "setLowerVib" => Intent::SetLowerVibration,
        _ => return None,
    })
}

pub fn route(path: &str) -> Route {
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    let intent = match segments.as_slice() {
        [""] => return Route::Root,
        ["stop"] => Intent::EnterPreset(Preset::Stop),
        ["flat"] => Intent::EnterPreset(Preset::Flat),
        ["zeroG"] => Intent::EnterPreset(Preset::ZeroG),
        ["noSnore"] => Intent::EnterPreset(Preset::NoSnore),
        ["getUpperHeight"] => Intent::UpperHeightQuery,
        ["getLowerHeight"] => Intent::LowerHeightQuery,
        ["getUpperVib"] => Intent::UpperVibrationQuery,
        ["getLowerVib"] => Intent::LowerVibrationQuery,
        ["status"] => Intent::StatusQuery,
        ["light", switch] => match Switch::parse(switch) {
            Some(Switch::On) => Intent::LightSet(true),
            Some(Switch::Off) => Intent::LightSet(false),
            Some(Switch::Status) => Intent::LightQuery,
            None => return Route::NotFound,
        },
        ["GPIOlight", switch] => {
            return Switch::parse(switch).map_or(Route::NotFound, Route::GpioLight);
        }
        [name, pct] => {
            let Some(intent) = percent_intent(name) else {
                return Route::NotFound;
            };
            match pct.parse::<i64>() {
                Ok(pct) => intent(pct),
                Err(_) => return Route::BadPercent(pct.to_string()),
            }
        }
        _ => return Route::NotFound,
    };
    Route::Bed(intent)
}

fn on_off(on: bool) -> &'static str {
    if on { "on" } else { "off" }
}

/// JSON field carrying a reading
fn field(reading: Reading) -> (&'static str, Value) {
    match reading {
        Reading::UpperHeight(p) => ("upper_height", p.into()),
        Reading::LowerHeight(p) => ("lower_height", p.into()),
        Reading::UpperVibration(p) => ("upper_vib", p.into()),
        Reading::LowerVibration(p) => ("lower_vib", p.into()),
        Reading::Light(on) => ("light_status", on_off(on).into()),
    }
}

/// What a successful write says it did
fn done_message(intent: Intent) -> String {
    match intent {
        Intent::EnterPreset(Preset::Stop) => "Stopped successfully".to_string(),
        Intent::EnterPreset(Preset::Flat) => "Flat set successfully".to_string(),
        Intent::EnterPreset(Preset::ZeroG) => "Zero G set successfully".to_string(),
        Intent::EnterPreset(Preset::NoSnore) => "No snore set successfully".to_string(),
        Intent::MoveUpper(p) => format!("Moved upper to {p}%"),
        Intent::MoveLower(p) => format!("Moved lower to {p}%"),
        Intent::SetUpperVibration(p) => format!("Set upper vib to {p}%"),
        Intent::SetLowerVibration(p) => format!("Set lower vib to {p}%"),
        Intent::LightSet(on) => format!("Light turned {}", on_off(on)),
        other => format!("{other} done"),
    }
}

fn success(intent: Intent, outcome: Outcome) -> HttpResult {
    let mut body = Map::new();
    body.insert("status".into(), "success".into());
    match outcome {
        Outcome::Applied => {
            body.insert("message".into(), done_message(intent).into());
        }
        Outcome::Confirmed(reading) => {
            body.insert("message".into(), done_message(intent).into());
            let (name, value) = field(reading);
            body.insert(name.into(), value);
        }
        Outcome::Reading(reading) => {
            let (name, value) = field(reading);
            body.insert(name.into(), value);
        }
        Outcome::LastCommanded(reading) => {
            let (name, value) = field(reading);
            body.insert(name.into(), value);
            body.insert(
                "message".into(),
                "the bed cannot report this, showing the last commanded value".into(),
            );
        }
        Outcome::Status(status) => {
            body.insert("device_status".into(), json!(status));
        }
    }
    json(Value::Object(body))
}

fn failure(intent: Intent, e: SessionError) -> HttpResult {
    let (code, status, message) = match &e {
        SessionError::InvalidArgument(invalid) => (
            StatusCode::BAD_REQUEST,
            "error",
            format!("Invalid percentage input: {}", invalid.value),
        ),
        SessionError::DeviceUnavailable { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "error", format!("Failed to {intent}: {e}"))
        }
        SessionError::TransportError(_) => {
            (StatusCode::BAD_GATEWAY, "error", format!("Failed to {intent}: {e}"))
        }
        SessionError::Decode(DecodeError::Unsupported(_)) => {
            (StatusCode::NOT_IMPLEMENTED, "unsupported", e.to_string())
        }
        SessionError::Decode(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "error",
            format!("Failed to {intent}: {e}"),
        ),
    };
    json_with_status(json!({"status": status, "message": message}), code)
}

fn error(code: StatusCode, message: String) -> HttpResult {
    json_with_status(json!({"status": "error", "message": message}), code)
}

/// Everything a request can reach
pub struct App<L: GattLink, P> {
    pub session: Arc<DeviceSession<L>>,
    /// `None` when no relay pin is configured
    pub relay: Option<RelayController<P>>,
}

impl<L: GattLink, P: OutputPin + Send> App<L, P> {
    pub fn new(session: DeviceSession<L>, relay: Option<RelayController<P>>) -> Self {
        Self {
            session: Arc::new(session),
            relay,
        }
    }

    pub async fn handle(&self, method: &Method, path: &str) -> HttpResult {
        if *method == Method::OPTIONS {
            let mut resp = bytes_to_resp(vec![], StatusCode::NO_CONTENT)?;
            resp.headers_mut().insert(
                hyper::header::ACCESS_CONTROL_ALLOW_METHODS,
                hyper::header::HeaderValue::from_static("GET, OPTIONS"),
            );
            return Ok(resp);
        }
        if *method != Method::GET {
            return bytes_to_resp(
                format!("{method} not allowed").into_bytes(),
                StatusCode::METHOD_NOT_ALLOWED,
            );
        }

        match route(path) {
            Route::Root => bytes_to_resp(GREETING.as_bytes().to_vec(), StatusCode::OK),
            Route::Bed(intent) => match self.session.execute(intent).await {
                Ok(outcome) => success(intent, outcome),
                Err(e) => failure(intent, e),
            },
            Route::GpioLight(switch) => self.gpio_light(switch),
            Route::BadPercent(raw) => {
                error(StatusCode::BAD_REQUEST, format!("Invalid percentage input: {raw}"))
            }
            Route::NotFound => crate::not_found!("not found: {path}"),
        }
    }

    fn gpio_light(&self, switch: Switch) -> HttpResult {
        let Some(relay) = &self.relay else {
            return error(StatusCode::NOT_FOUND, "GPIO light is not configured".to_string());
        };
        let on = match switch {
            Switch::Status => {
                return json(json!({
                    "status": "success",
                    "gpio_light_status": on_off(relay.get_light()),
                }));
            }
            Switch::On => true,
            Switch::Off => false,
        };
        match relay.set_light(on) {
            Ok(()) => json(json!({
                "status": "success",
                "message": format!("GPIO light turned {}", on_off(on)),
            })),
            Err(e) => {
                tracing::error!("{e}");
                error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Failed to turn GPIO light {}", on_off(on)),
                )
            }
        }
    }

    /// Disconnect from the bed and release the relay pin
    pub async fn shutdown(&self) {
        self.session.shutdown().await;
        if let Some(relay) = &self.relay {
            relay.shutdown();
        }
    }
}

#[cfg(test)]
impl App<bedside_ble::SimulatedBed, crate::gpio::MemoryPin> {
    /// Simulated bed with instant lifts that never waits between steps and
    /// gives up quickly on busy
    pub(crate) fn simulated(bed: bedside_ble::SimulatedBed) -> Self {
        use std::time::Duration;

        let instant = bedside_proto::DeviceProfile {
            full_travel_ms: 0,
            ..Default::default()
        };
        let codec = bedside_proto::Codec::new("instant", instant).unwrap();

        let identity = bedside_ble::PeripheralIdentity::new(bedside_ble::MacAddress([0; 6]));
        let config = bedside_ble::SessionConfig {
            busy_retry: bedside_ble::RetryPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
            },
            preset_step_delay: Duration::ZERO,
            ..Default::default()
        };
        let relay = RelayController::new(crate::gpio::MemoryPin::default());
        Self::new(DeviceSession::new(bed, identity, codec, config), Some(relay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bedside_ble::SimulatedBed;
    use bedside_proto::Characteristic;
    use http_body_util::BodyExt;

    async fn call<L: GattLink, P: OutputPin + Send>(app: &App<L, P>, path: &str) -> (StatusCode, Value) {
        let resp = app.handle(&Method::GET, path).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn bed<P>(app: &App<SimulatedBed, P>) -> &SimulatedBed {
        app.session.link()
    }

    #[test]
    fn paths_map_to_intents() {
        assert_eq!(route("/"), Route::Root);
        assert_eq!(route("/flat"), Route::Bed(Intent::EnterPreset(Preset::Flat)));
        assert_eq!(route("/moveUpper/40"), Route::Bed(Intent::MoveUpper(40)));
        assert_eq!(route("/setLowerVib/-3"), Route::Bed(Intent::SetLowerVibration(-3)));
        assert_eq!(route("/moveLower/abc"), Route::BadPercent("abc".to_string()));
        assert_eq!(route("/light/status"), Route::Bed(Intent::LightQuery));
        assert_eq!(route("/GPIOlight/on"), Route::GpioLight(Switch::On));
        assert_eq!(route("/light/dim"), Route::NotFound);
        assert_eq!(route("/moveSideways/10"), Route::NotFound);
        assert_eq!(route("/flat/now"), Route::NotFound);
    }

    #[tokio::test]
    async fn move_upper_reports_confirmed_height() {
        let app = App::simulated(SimulatedBed::new());
        let (status, body) = call(&app, "/moveUpper/40").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["message"], "Moved upper to 40%");
        assert_eq!(body["upper_height"], 40);
        assert_eq!(bed(&app).value(Characteristic::UpperLift), vec![40]);
    }

    #[tokio::test]
    async fn bad_percentages_are_400_without_ble() {
        let app = App::simulated(SimulatedBed::new());
        for path in ["/moveUpper/101", "/setUpperVib/-1", "/moveLower/ten"] {
            let (status, body) = call(&app, path).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{path}");
            assert_eq!(body["status"], "error");
            assert!(body["message"].as_str().unwrap().starts_with("Invalid percentage input"));
        }
        assert_eq!(bed(&app).stats().connect_attempts, 0);
    }

    #[tokio::test]
    async fn presets_and_queries() {
        let app = App::simulated(SimulatedBed::new());
        let (status, body) = call(&app, "/zeroG").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Zero G set successfully");

        let (_, body) = call(&app, "/getUpperHeight").await;
        assert_eq!(body, json!({"status": "success", "upper_height": 70}));
        let (_, body) = call(&app, "/getLowerHeight").await;
        assert_eq!(body["lower_height"], 31);

        let (_, body) = call(&app, "/status").await;
        assert_eq!(body["device_status"]["upper_height_pct"], 70);
        assert_eq!(body["device_status"]["light_on"], false);
    }

    #[tokio::test]
    async fn light_over_ble() {
        let app = App::simulated(SimulatedBed::new());
        let (_, body) = call(&app, "/light/on").await;
        assert_eq!(body["message"], "Light turned on");
        assert_eq!(bed(&app).value(Characteristic::Light), vec![0x64]);

        let (_, body) = call(&app, "/light/status").await;
        assert_eq!(body, json!({"status": "success", "light_status": "on"}));
    }

    #[tokio::test]
    async fn unreadable_light_is_unsupported_until_commanded() {
        let app = App::simulated(SimulatedBed::new());
        bed(&app).set_light_readable(false);

        let (status, body) = call(&app, "/light/status").await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert_eq!(body["status"], "unsupported");

        call(&app, "/light/off").await;
        let (status, body) = call(&app, "/light/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["light_status"], "off");
    }

    #[tokio::test]
    async fn missing_light_characteristic_is_501_without_reconnect() {
        let app = App::simulated(SimulatedBed::new());
        bed(&app).set_light_exposed(false);

        let (status, body) = call(&app, "/light/on").await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert_eq!(body["status"], "unsupported");
        assert_eq!(bed(&app).stats().connects, 1);
        assert!(bed(&app).is_connected());
    }

    #[tokio::test]
    async fn session_errors_have_distinct_codes() {
        let app = App::simulated(SimulatedBed::new());
        bed(&app).fail_connect(Some(bedside_ble::ConnError::Busy));
        let (status, body) = call(&app, "/flat").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "error");

        bed(&app).fail_connect(Some(bedside_ble::ConnError::Denied("nope".into())));
        let (status, _) = call(&app, "/stop").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        bed(&app).fail_connect(None);
        bed(&app).set_value(Characteristic::UpperVibration, vec![200]);
        let (status, _) = call(&app, "/getUpperVib").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn gpio_light_tracks_last_command() {
        let app = App::simulated(SimulatedBed::new());
        let (_, body) = call(&app, "/GPIOlight/status").await;
        assert_eq!(body["gpio_light_status"], "off");

        let (_, body) = call(&app, "/GPIOlight/on").await;
        assert_eq!(body["message"], "GPIO light turned on");
        let (_, body) = call(&app, "/GPIOlight/status").await;
        assert_eq!(body["gpio_light_status"], "on");
        assert_eq!(bed(&app).stats().connect_attempts, 0);
    }

    #[tokio::test]
    async fn gpio_light_without_pin_is_404() {
        let mut app = App::simulated(SimulatedBed::new());
        app.relay = None;
        let (status, _) = call(&app, "/GPIOlight/on").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn root_and_preflight() {
        let app = App::simulated(SimulatedBed::new());
        let resp = app.handle(&Method::GET, "/").await.unwrap();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], GREETING.as_bytes());

        let resp = app.handle(&Method::OPTIONS, "/flat").await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let resp = app.handle(&Method::POST, "/flat").await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(bed(&app).stats().connect_attempts, 0);
    }
}

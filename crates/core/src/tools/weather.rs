//! Weather lookup tool backed by the Open-Meteo public API.

use super::{
    registry::{ToolContext, ToolDescriptor, ToolError, ToolHandler},
    schema::{ParamKind, ParameterSchema},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

pub const TOOL_NAME: &str = "get_weather";

const GEOCODING_URL: &str = "https://geocoding-api.open-meteo.com/v1/search";
const FORECAST_URL: &str = "https://api.open-meteo.com/v1/forecast";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentWeather {
    pub location: String,
    pub temperature_c: f64,
    pub wind_speed_kmh: f64,
    pub conditions: String,
}

#[derive(Debug, thiserror::Error)]
pub enum WeatherError {
    #[error("no place called '{0}' was found")]
    UnknownLocation(String),
    #[error("weather service request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Source of current conditions for a free-text location.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WeatherProvider: Send + Sync {
    async fn current(&self, location: &str) -> Result<CurrentWeather, WeatherError>;
}

/// [`WeatherProvider`] that geocodes with Open-Meteo and then fetches the forecast.
pub struct OpenMeteoClient {
    http: reqwest::Client,
    geocoding_url: String,
    forecast_url: String,
}

impl OpenMeteoClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_urls(http, GEOCODING_URL, FORECAST_URL)
    }

    pub fn with_urls(http: reqwest::Client, geocoding_url: &str, forecast_url: &str) -> Self {
        Self {
            http,
            geocoding_url: geocoding_url.to_string(),
            forecast_url: forecast_url.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct GeocodingResponse {
    #[serde(default)]
    results: Vec<Place>,
}

#[derive(Deserialize)]
struct Place {
    name: String,
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    country: Option<String>,
}

#[derive(Deserialize)]
struct ForecastResponse {
    current: Current,
}

#[derive(Deserialize)]
struct Current {
    temperature_2m: f64,
    wind_speed_10m: f64,
    weather_code: u32,
}

#[async_trait]
impl WeatherProvider for OpenMeteoClient {
    async fn current(&self, location: &str) -> Result<CurrentWeather, WeatherError> {
        let places: GeocodingResponse = self
            .http
            .get(&self.geocoding_url)
            .query(&[("name", location), ("count", "1")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let place = places
            .results
            .into_iter()
            .next()
            .ok_or_else(|| WeatherError::UnknownLocation(location.to_string()))?;
        debug!(place = %place.name, lat = place.latitude, lon = place.longitude, "Geocoded location");

        let forecast: ForecastResponse = self
            .http
            .get(&self.forecast_url)
            .query(&[
                ("latitude", place.latitude.to_string()),
                ("longitude", place.longitude.to_string()),
                (
                    "current",
                    "temperature_2m,wind_speed_10m,weather_code".to_string(),
                ),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let location = match place.country {
            Some(country) => format!("{}, {}", place.name, country),
            None => place.name,
        };
        Ok(CurrentWeather {
            location,
            temperature_c: forecast.current.temperature_2m,
            wind_speed_kmh: forecast.current.wind_speed_10m,
            conditions: describe_weather_code(forecast.current.weather_code).to_string(),
        })
    }
}

/// Maps a WMO weather interpretation code to words a voice agent can say.
pub fn describe_weather_code(code: u32) -> &'static str {
    match code {
        0 => "clear sky",
        1 | 2 => "partly cloudy",
        3 => "overcast",
        45 | 48 => "foggy",
        51..=57 => "drizzle",
        61..=67 => "rain",
        71..=77 => "snow",
        80..=82 => "rain showers",
        85 | 86 => "snow showers",
        95..=99 => "thunderstorms",
        _ => "unsettled",
    }
}

#[derive(Debug, Deserialize)]
struct GetWeatherArgs {
    location: String,
}

pub struct GetWeatherTool {
    provider: Arc<dyn WeatherProvider>,
}

impl GetWeatherTool {
    pub fn new(provider: Arc<dyn WeatherProvider>) -> Self {
        Self { provider }
    }

    pub fn descriptor() -> ToolDescriptor {
        ToolDescriptor {
            name: TOOL_NAME.to_string(),
            description: "Get the current weather for a city or place.".to_string(),
            parameters: ParameterSchema::new().required(
                "location",
                ParamKind::String,
                "City or place name, e.g. 'Berlin' or 'Austin, Texas'.",
            ),
        }
    }
}

#[async_trait]
impl ToolHandler for GetWeatherTool {
    async fn call(&self, args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let args: GetWeatherArgs = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        let weather = self
            .provider
            .current(&args.location)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(json!({
            "success": true,
            "location": weather.location,
            "temperature_c": weather.temperature_c,
            "wind_speed_kmh": weather.wind_speed_kmh,
            "conditions": weather.conditions,
        }))
    }
}

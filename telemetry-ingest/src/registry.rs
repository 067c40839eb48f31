use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::retry::{classify, PatchError};
use crate::types::{
    DoorSensorTelemetry, EnergyMeterTelemetry, SmartLightTelemetry, SmartPlugTelemetry,
    SoilMoistureTelemetry, TelemetryPayload, TemperatureTelemetry, ThermostatMode,
    ThermostatTelemetry,
};

/// Affected-row outcome of one applied patch. Feeds metrics only; control
/// flow never branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    NoRowsAffected,
    OneRowAffected,
    MultipleRowsAffected,
}

impl PatchOutcome {
    pub fn from_rows_affected(rows: u64) -> Self {
        match rows {
            0 => PatchOutcome::NoRowsAffected,
            1 => PatchOutcome::OneRowAffected,
            _ => PatchOutcome::MultipleRowsAffected,
        }
    }
}

/// The registry side of the pipeline: one patch method per telemetry
/// variant, each returning the affected-row count. Implementations must be
/// safe to call repeatedly with the same logical update, since a retry can
/// repeat a call whose outcome was unknown.
#[async_trait]
pub trait DeviceRegistry: Send + Sync + 'static {
    async fn patch_door_sensor(
        &self,
        device_id: &str,
        telemetry: &DoorSensorTelemetry,
        reported_at: Option<DateTime<Utc>>,
    ) -> Result<u64, sqlx::Error>;

    async fn patch_energy_meter(
        &self,
        device_id: &str,
        telemetry: &EnergyMeterTelemetry,
        reported_at: Option<DateTime<Utc>>,
    ) -> Result<u64, sqlx::Error>;

    async fn patch_smart_light(
        &self,
        device_id: &str,
        telemetry: &SmartLightTelemetry,
        reported_at: Option<DateTime<Utc>>,
    ) -> Result<u64, sqlx::Error>;

    async fn patch_smart_plug(
        &self,
        device_id: &str,
        telemetry: &SmartPlugTelemetry,
        reported_at: Option<DateTime<Utc>>,
    ) -> Result<u64, sqlx::Error>;

    async fn patch_soil_moisture_sensor(
        &self,
        device_id: &str,
        telemetry: &SoilMoistureTelemetry,
        reported_at: Option<DateTime<Utc>>,
    ) -> Result<u64, sqlx::Error>;

    async fn patch_temperature_sensor(
        &self,
        device_id: &str,
        telemetry: &TemperatureTelemetry,
        reported_at: Option<DateTime<Utc>>,
    ) -> Result<u64, sqlx::Error>;

    async fn patch_thermostat(
        &self,
        device_id: &str,
        telemetry: &ThermostatTelemetry,
        reported_at: Option<DateTime<Utc>>,
    ) -> Result<u64, sqlx::Error>;
}

/// Route one decoded payload to its patch method. The match is exhaustive on
/// purpose: a new telemetry variant won't compile until it's handled here.
pub async fn apply_telemetry<R: DeviceRegistry + ?Sized>(
    registry: &R,
    device_id: &str,
    payload: &TelemetryPayload,
    reported_at: Option<DateTime<Utc>>,
) -> Result<u64, PatchError> {
    let result = match payload {
        TelemetryPayload::DoorSensor(t) => {
            registry.patch_door_sensor(device_id, t, reported_at).await
        }
        TelemetryPayload::EnergyMeter(t) => {
            registry.patch_energy_meter(device_id, t, reported_at).await
        }
        TelemetryPayload::SmartLight(t) => {
            registry.patch_smart_light(device_id, t, reported_at).await
        }
        TelemetryPayload::SmartPlug(t) => {
            registry.patch_smart_plug(device_id, t, reported_at).await
        }
        TelemetryPayload::SoilMoistureSensor(t) => {
            registry
                .patch_soil_moisture_sensor(device_id, t, reported_at)
                .await
        }
        TelemetryPayload::TemperatureSensor(t) => {
            registry
                .patch_temperature_sensor(device_id, t, reported_at)
                .await
        }
        TelemetryPayload::Thermostat(t) => {
            registry.patch_thermostat(device_id, t, reported_at).await
        }
    };

    result.map_err(classify)
}

/// Postgres-backed registry. Each device kind has a state table keyed by
/// device id; patches are plain updates, which makes replays of the same
/// telemetry harmless.
pub struct PgDeviceRegistry {
    pool: PgPool,
}

impl PgDeviceRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceRegistry for PgDeviceRegistry {
    async fn patch_door_sensor(
        &self,
        device_id: &str,
        telemetry: &DoorSensorTelemetry,
        reported_at: Option<DateTime<Utc>>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE door_sensor
               SET is_open = $2, battery_pct = $3, reported_at = $4
             WHERE device_id = $1"#,
        )
        .bind(device_id)
        .bind(telemetry.open)
        .bind(telemetry.battery_pct)
        .bind(reported_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn patch_energy_meter(
        &self,
        device_id: &str,
        telemetry: &EnergyMeterTelemetry,
        reported_at: Option<DateTime<Utc>>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE energy_meter
               SET power_w = $2, energy_kwh = $3, reported_at = $4
             WHERE device_id = $1"#,
        )
        .bind(device_id)
        .bind(telemetry.power_w)
        .bind(telemetry.energy_kwh)
        .bind(reported_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn patch_smart_light(
        &self,
        device_id: &str,
        telemetry: &SmartLightTelemetry,
        reported_at: Option<DateTime<Utc>>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE smart_light
               SET is_on = $2, brightness_pct = $3, color_temp_k = $4, reported_at = $5
             WHERE device_id = $1"#,
        )
        .bind(device_id)
        .bind(telemetry.on)
        .bind(i16::from(telemetry.brightness_pct))
        .bind(telemetry.color_temp_k.map(|k| k as i32))
        .bind(reported_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn patch_smart_plug(
        &self,
        device_id: &str,
        telemetry: &SmartPlugTelemetry,
        reported_at: Option<DateTime<Utc>>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE smart_plug
               SET is_on = $2, power_w = $3, reported_at = $4
             WHERE device_id = $1"#,
        )
        .bind(device_id)
        .bind(telemetry.on)
        .bind(telemetry.power_w)
        .bind(reported_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn patch_soil_moisture_sensor(
        &self,
        device_id: &str,
        telemetry: &SoilMoistureTelemetry,
        reported_at: Option<DateTime<Utc>>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE soil_moisture_sensor
               SET moisture_pct = $2, battery_pct = $3, reported_at = $4
             WHERE device_id = $1"#,
        )
        .bind(device_id)
        .bind(telemetry.moisture_pct)
        .bind(telemetry.battery_pct)
        .bind(reported_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn patch_temperature_sensor(
        &self,
        device_id: &str,
        telemetry: &TemperatureTelemetry,
        reported_at: Option<DateTime<Utc>>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE temperature_sensor
               SET temperature_c = $2, humidity_pct = $3, reported_at = $4
             WHERE device_id = $1"#,
        )
        .bind(device_id)
        .bind(telemetry.temperature_c)
        .bind(telemetry.humidity_pct)
        .bind(reported_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn patch_thermostat(
        &self,
        device_id: &str,
        telemetry: &ThermostatTelemetry,
        reported_at: Option<DateTime<Utc>>,
    ) -> Result<u64, sqlx::Error> {
        let mode = match telemetry.mode {
            ThermostatMode::Off => "off",
            ThermostatMode::Heat => "heat",
            ThermostatMode::Cool => "cool",
            ThermostatMode::Auto => "auto",
        };

        let result = sqlx::query(
            r#"
            UPDATE thermostat
               SET mode = $2, target_temp_c = $3, current_temp_c = $4, reported_at = $5
             WHERE device_id = $1"#,
        )
        .bind(device_id)
        .bind(mode)
        .bind(telemetry.target_temp_c)
        .bind(telemetry.current_temp_c)
        .bind(reported_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_affected_maps_to_outcome() {
        assert_eq!(
            PatchOutcome::from_rows_affected(0),
            PatchOutcome::NoRowsAffected
        );
        assert_eq!(
            PatchOutcome::from_rows_affected(1),
            PatchOutcome::OneRowAffected
        );
        assert_eq!(
            PatchOutcome::from_rows_affected(7),
            PatchOutcome::MultipleRowsAffected
        );
    }
}

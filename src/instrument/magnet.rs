//! Superconducting magnet power supply driver (AMI 430-class).
//!
//! Protocol overview:
//! - ASCII commands over TCP or serial, LF terminated
//! - `CONF:FIELD:TARG <T>`, `CONF:RAMP:RATE:FIELD <T/min>`
//! - `PSWITCH?` persistent-switch heater state, `STATE?` supply state code,
//!   `FIELD:MAG?` current field
//!
//! Field and ramp-rate bounds are per-magnet and come from configuration, not
//! from the supply: the supply will happily quench an underspecified magnet.

use crate::error::LabError;
use crate::instrument::transport::Transport;
use crate::instrument::Instrument;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::info;
use std::sync::Arc;
use std::time::Duration;

/// Supply state codes from the `STATE?` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupplyState {
    RampingToTarget,
    HoldingAtTarget,
    Paused,
    RampingToZero,
    AtZero,
    QuenchDetected,
    Unknown(u8),
}

impl SupplyState {
    fn from_code(code: u8) -> Self {
        match code {
            1 => SupplyState::RampingToTarget,
            2 => SupplyState::HoldingAtTarget,
            3 => SupplyState::Paused,
            6 => SupplyState::RampingToZero,
            8 => SupplyState::AtZero,
            7 => SupplyState::QuenchDetected,
            other => SupplyState::Unknown(other),
        }
    }
}

/// Driver for the magnet power supply, carrying the magnet's own limits.
pub struct MagnetSupply {
    transport: Arc<dyn Transport>,
    id: String,
    /// Maximum field magnitude for the attached magnet, in tesla.
    max_field_t: f64,
    /// Maximum ramp rate for the attached magnet, in tesla/minute.
    max_ramp_rate_t_per_min: f64,
    poll_interval: Duration,
}

impl MagnetSupply {
    pub fn new(
        id: &str,
        transport: Arc<dyn Transport>,
        max_field_t: f64,
        max_ramp_rate_t_per_min: f64,
    ) -> Self {
        Self {
            transport,
            id: id.to_string(),
            max_field_t,
            max_ramp_rate_t_per_min,
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub async fn identify(&self) -> Result<String> {
        self.transport.ask("*IDN?").await
    }

    /// Current field at the magnet in tesla.
    pub async fn field(&self) -> Result<f64> {
        let response = self.transport.ask("FIELD:MAG?").await?;
        response
            .trim()
            .parse::<f64>()
            .with_context(|| format!("{}: unparseable field '{response}'", self.id))
    }

    /// Whether the persistent-switch heater is on (magnet connected to supply).
    pub async fn switch_heater_on(&self) -> Result<bool> {
        let response = self.transport.ask("PSWITCH?").await?;
        Ok(response.trim() == "1")
    }

    pub async fn set_switch_heater(&self, on: bool) -> Result<()> {
        let cmd = if on { "PSWITCH 1" } else { "PSWITCH 0" };
        self.transport.write(cmd).await?;
        // The switch takes tens of seconds to go normal/superconducting; the
        // caller decides how long to wait before ramping.
        Ok(())
    }

    pub async fn set_ramp_rate(&self, t_per_min: f64) -> Result<()> {
        if t_per_min <= 0.0 || t_per_min > self.max_ramp_rate_t_per_min {
            return Err(LabError::safety(
                format!("{} ramp rate", self.id),
                t_per_min,
                self.max_ramp_rate_t_per_min,
            )
            .into());
        }
        self.transport
            .write(&format!("CONF:RAMP:RATE:FIELD {t_per_min}"))
            .await
    }

    pub async fn state(&self) -> Result<SupplyState> {
        let response = self.transport.ask("STATE?").await?;
        let code: u8 = response
            .trim()
            .parse()
            .with_context(|| format!("{}: unparseable state '{response}'", self.id))?;
        Ok(SupplyState::from_code(code))
    }

    /// Set the target field and start ramping.
    ///
    /// Refuses to move with the persistent-switch heater off: ramping the
    /// supply against a persistent magnet dumps the mismatch into the switch.
    pub async fn ramp_to_field(&self, target_t: f64) -> Result<()> {
        if target_t.abs() > self.max_field_t {
            return Err(LabError::safety(
                format!("{} field", self.id),
                target_t,
                self.max_field_t,
            )
            .into());
        }
        if !self.switch_heater_on().await? {
            return Err(anyhow!(
                "{}: persistent switch heater is off; refusing to ramp",
                self.id
            ));
        }
        self.transport
            .write(&format!("CONF:FIELD:TARG {target_t}"))
            .await?;
        self.transport.write("RAMP").await?;
        info!("{}: ramping to {} T", self.id, target_t);
        Ok(())
    }

    /// Block until the supply reports holding at target, or fail on quench.
    pub async fn wait_settled(&self, timeout: Duration) -> Result<()> {
        let start = tokio::time::Instant::now();
        loop {
            match self.state().await? {
                SupplyState::HoldingAtTarget | SupplyState::AtZero => return Ok(()),
                SupplyState::QuenchDetected => {
                    return Err(anyhow!("{}: quench detected during ramp", self.id));
                }
                _ => {}
            }
            if start.elapsed() > timeout {
                return Err(anyhow!("{}: ramp did not settle within {timeout:?}", self.id));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Ramp to target and wait for the supply to settle there.
    pub async fn ramp_and_wait(&self, target_t: f64, timeout: Duration) -> Result<f64> {
        self.ramp_to_field(target_t).await?;
        self.wait_settled(timeout).await?;
        self.field().await
    }
}

#[async_trait]
impl Instrument for MagnetSupply {
    fn name(&self) -> String {
        self.id.clone()
    }

    /// Ramp the supply output to zero.
    async fn shutdown(&self) -> Result<()> {
        self.transport.write("ZERO").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::transport::MockTransport;

    #[tokio::test]
    async fn refuses_ramp_with_heater_off() {
        let mock = Arc::new(MockTransport::new().with_response("PSWITCH?", "0"));
        let magnet = MagnetSupply::new("magnet", mock, 9.0, 0.5);
        let err = magnet.ramp_to_field(1.0).await.unwrap_err();
        assert!(err.to_string().contains("persistent switch"));
    }

    #[tokio::test]
    async fn field_limit_is_a_safety_error() {
        let mock = Arc::new(MockTransport::new().with_response("PSWITCH?", "1"));
        let magnet = MagnetSupply::new("magnet", mock, 9.0, 0.5);
        let err = magnet.ramp_to_field(9.5).await.unwrap_err();
        assert!(matches!(
            err.downcast::<LabError>().unwrap(),
            LabError::SafetyLimit { .. }
        ));
    }

    #[tokio::test]
    async fn ramp_issues_target_then_ramp() {
        let mock = Arc::new(MockTransport::new().with_response("PSWITCH?", "1"));
        let magnet = MagnetSupply::new("magnet", mock.clone(), 9.0, 0.5);
        magnet.ramp_to_field(2.5).await.unwrap();
        let sent = mock.sent();
        assert!(sent.contains(&"CONF:FIELD:TARG 2.5".to_string()));
        assert_eq!(sent.last().map(String::as_str), Some("RAMP"));
    }

    #[tokio::test]
    async fn wait_settled_detects_quench() {
        let mock = Arc::new(MockTransport::new().with_response("STATE?", "7"));
        let magnet = MagnetSupply::new("magnet", mock, 9.0, 0.5)
            .with_poll_interval(Duration::from_millis(1));
        let err = magnet.wait_settled(Duration::from_millis(50)).await.unwrap_err();
        assert!(err.to_string().contains("quench"));
    }

    #[test]
    fn state_codes_map() {
        assert_eq!(SupplyState::from_code(2), SupplyState::HoldingAtTarget);
        assert_eq!(SupplyState::from_code(7), SupplyState::QuenchDetected);
        assert_eq!(SupplyState::from_code(42), SupplyState::Unknown(42));
    }
}

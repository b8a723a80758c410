//! Geräte-Prüfung über cpal
//!
//! Prüft vor dem Erzeugen des lokalen Streams, ob ein Mikrofon mit einer
//! brauchbaren Konfiguration vorhanden ist. Nur mit Feature `audio-devices`.

use super::devices::{MediaAcquisitionError, MediaDevices, SyntheticDevices};
use super::stream::{MediaConstraints, MediaStream};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{SampleFormat, SupportedStreamConfigRange};

/// Sample Rate (48kHz ist der Standard für WebRTC/Opus)
pub const SAMPLE_RATE: u32 = 48000;

/// `MediaDevices` mit echter Mikrofon-Erkennung
#[derive(Debug, Clone, Default)]
pub struct CpalDevices;

impl CpalDevices {
    /// Prüft das Standard-Eingabegerät
    fn default_input_name() -> Result<String, MediaAcquisitionError> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| MediaAcquisitionError::DeviceNotFound("microphone".to_string()))?;

        let name = device.name().unwrap_or_else(|_| "unknown".to_string());

        let configs: Vec<SupportedStreamConfigRange> = device
            .supported_input_configs()
            .map_err(|e| MediaAcquisitionError::Unavailable(e.to_string()))?
            .collect();

        if !Self::has_usable_config(&configs) {
            return Err(MediaAcquisitionError::Unavailable(format!(
                "microphone '{}' has no usable configuration",
                name
            )));
        }

        Ok(name)
    }

    /// 48kHz F32 bevorzugt, aber jede Konfiguration ist nutzbar
    fn has_usable_config(configs: &[SupportedStreamConfigRange]) -> bool {
        let target_rate = cpal::SampleRate(SAMPLE_RATE);

        let exact = configs.iter().any(|c| {
            c.min_sample_rate() <= target_rate
                && c.max_sample_rate() >= target_rate
                && c.sample_format() == SampleFormat::F32
        });
        if !exact && !configs.is_empty() {
            tracing::warn!("No 48kHz F32 input configuration, falling back to device default");
        }

        !configs.is_empty()
    }
}

#[async_trait]
impl MediaDevices for CpalDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaAcquisitionError> {
        if constraints.audio {
            let name = tokio::task::spawn_blocking(Self::default_input_name)
                .await
                .map_err(|e| MediaAcquisitionError::Unavailable(e.to_string()))??;
            tracing::info!("Using audio input device '{}'", name);
        }

        SyntheticDevices.get_user_media(constraints).await
    }
}

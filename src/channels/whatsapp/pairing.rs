use super::state::PairingCode;
use anyhow::{Result, anyhow};
use base64::Engine as _;
use qrcode::QrCode;
use qrcode::render::{svg, unicode};

fn encode(payload: &str) -> Result<QrCode> {
    let payload = payload.trim();
    if payload.is_empty() {
        anyhow::bail!("QR payload is empty");
    }
    QrCode::new(payload.as_bytes())
        .map_err(|err| anyhow!("Failed to encode WhatsApp Web QR payload: {err}"))
}

/// Render a pairing payload as an SVG `data:` URL for the dashboard.
pub fn render_data_url(payload: &str) -> Result<String> {
    let svg = encode(payload)?
        .render::<svg::Color<'_>>()
        .min_dimensions(256, 256)
        .quiet_zone(true)
        .build();
    let encoded = base64::engine::general_purpose::STANDARD.encode(svg.as_bytes());
    Ok(format!("data:image/svg+xml;base64,{encoded}"))
}

/// Render a pairing payload into terminal-friendly text.
pub fn render_terminal(payload: &str) -> Result<String> {
    Ok(encode(payload)?
        .render::<unicode::Dense1x2>()
        .quiet_zone(true)
        .build())
}

pub fn pairing_code(payload: &str) -> Result<PairingCode> {
    Ok(PairingCode {
        raw: payload.trim().to_string(),
        image: render_data_url(payload)?,
    })
}

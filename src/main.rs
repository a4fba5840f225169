//! voicebridge daemon
//!
//! Registers with the SIP trunk, serves the hosted media-stream WebSocket,
//! and optionally dials an outbound call given on the command line.

use voicebridge::agent::AgentConfig;
use voicebridge::bridge::{CallEngine, MediaStreamServer};
use voicebridge::config::EngineConfig;
use voicebridge::sip::SipConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,voicebridge=debug".parse().unwrap()),
        )
        .init();

    let engine_cfg = EngineConfig::from_env();
    let sip_cfg = SipConfig::from_env();
    if sip_cfg.is_none() {
        tracing::info!("SIP trunk not configured, hosted media streams only");
    }

    let sip_enabled = sip_cfg.is_some();
    let engine = CallEngine::from_config(engine_cfg, sip_cfg).await?;

    // the default agent answers calls that do not name one
    engine.register_agent("default", load_default_agent()).await;

    if sip_enabled {
        engine.register().await?;
        tracing::info!("SIP registration complete");
    }

    // hosted media-stream transport
    let stream_addr =
        std::env::var("MEDIA_STREAM_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let server = MediaStreamServer::bind(engine.clone(), &stream_addr).await?;
    tokio::spawn(server.run());

    // optional outbound call: `voicebridge <number>`
    if let Some(number) = std::env::args().nth(1) {
        let call_id = engine.start_outbound_call("default", &number).await?;
        tracing::info!("Outbound call {} to {}", call_id, number);
    }

    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutting down");
    engine.shutdown().await;

    Ok(())
}

fn load_default_agent() -> AgentConfig {
    let mut agent = AgentConfig::default();

    if let Ok(prompt) = std::env::var("AGENT_SYSTEM_PROMPT") {
        agent.model.system_prompt = prompt;
    }
    if let Ok(first_message) = std::env::var("AGENT_FIRST_MESSAGE") {
        agent.first_message = first_message;
    }
    if let Ok(voice_id) = std::env::var("AGENT_VOICE_ID") {
        agent.voice.voice_id = voice_id;
    }
    if let Ok(model) = std::env::var("AGENT_MODEL") {
        agent.model.model_name = model;
    }

    agent
}

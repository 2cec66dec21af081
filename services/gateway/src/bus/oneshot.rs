//! Connect, publish one message, disconnect
//!
//! Used by the control CLI. The message goes out at QoS 1 and the call only
//! returns `Ok` after the broker acknowledged it.

use rumqttc::{AsyncClient, Event, Incoming, Outgoing, QoS};
use std::time::Duration;
use tracing::debug;

use super::{mqtt_options, BusError};
use crate::config::BusConfig;

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Publish `payload` on `topic` and wait for PUBACK
pub async fn publish_once(
    config: &BusConfig,
    client_id: &str,
    topic: &str,
    payload: &[u8],
    limit: Duration,
) -> Result<(), BusError> {
    let options = mqtt_options(config, client_id)?;
    let (client, mut eventloop) = AsyncClient::new(options, 10);

    client
        .try_publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
        .map_err(BusError::from)?;

    let acked = tokio::time::timeout(limit, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    debug!("Connected to {}:{}", config.host, config.port);
                },
                Ok(Event::Incoming(Incoming::PubAck(_))) => return Ok(()),
                Ok(_) => {},
                Err(e) => return Err(BusError::Connection(e.to_string())),
            }
        }
    })
    .await
    .map_err(|_| {
        BusError::Timeout(format!(
            "no acknowledgement from {}:{} within {:?}",
            config.host, config.port, limit
        ))
    })?;
    acked?;

    if client.try_disconnect().is_ok() {
        let _ = tokio::time::timeout(DISCONNECT_TIMEOUT, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {},
                }
            }
        })
        .await;
    }

    debug!(topic, "Published and disconnected");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_broker_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = BusConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..Default::default()
        };
        let result = publish_once(
            &config,
            "remote-control-test",
            "gatewayTemperaturas/control/tiemporeal",
            b"START",
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(BusError::Connection(_))));
    }
}

use crate::config::Config;
use crate::handler::MessageHandler;
use anyhow::Result;
use rumqttc::{AsyncClient, ClientError, Event, Incoming, MqttOptions, QoS, SubscribeFilter};
use tokio::time::{sleep, Duration};

/// Delivery loop for the sensor topics. Messages are handed to the handler one at
/// a time in arrival order; the handler never waits on the database, so a slow
/// flush cannot stall the broker connection.
pub async fn run_listener(config: Config, handler: MessageHandler) -> Result<()> {
    let stats = handler.stats();
    loop {
        let mut mqttoptions = MqttOptions::new(
            config.mqtt_client_id.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        mqttoptions.set_keep_alive(config.mqtt_keepalive());
        if let Some(username) = &config.mqtt_username {
            mqttoptions.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 32);

        if let Err(err) = subscribe_all(&client, &config.mqtt_topics).await {
            tracing::warn!(error=%err, topics=?config.mqtt_topics, "failed to subscribe to MQTT; retrying");
            stats.set_mqtt_connected(false);
            sleep(Duration::from_secs(2)).await;
            continue;
        }

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    stats.set_mqtt_connected(true);
                    tracing::info!(
                        host=%config.mqtt_host,
                        port=config.mqtt_port,
                        topics=?config.mqtt_topics,
                        "connected to MQTT broker"
                    );
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let mut payload = publish.payload.to_vec();
                    handler.handle(&publish.topic, &mut payload);
                }
                Ok(_) => {}
                Err(err) => {
                    stats.set_mqtt_connected(false);
                    tracing::warn!(error=%err, "MQTT connection dropped; reconnecting");
                    break;
                }
            }
        }

        sleep(Duration::from_secs(1)).await;
    }
}

/// Queues every filter as a single SUBSCRIBE, so the request channel holds one
/// entry no matter how many topics are configured.
async fn subscribe_all(client: &AsyncClient, topics: &[String]) -> Result<(), ClientError> {
    let filters = topics
        .iter()
        .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtLeastOnce));
    client.subscribe_many(filters).await
}

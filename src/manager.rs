use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::broadcast;

use crate::coordinator::Coordinator;
use crate::messages::{MowerCommand, MqttAnnouncement, RefreshOutcome, UpdateNotice};
use crate::mqtt::MqttClient;
use crate::session::{DeviceDiscovery, MowerSession};

/// Connects the coordinator to Home Assistant: state out, commands in.
pub struct Manager<S, D> {
    coordinator: Arc<Coordinator<S, D>>,
    mqtt_client: MqttClient,
    mqtt_event_loop: rumqttc::EventLoop,
}

impl<S, D> Manager<S, D>
where
    S: MowerSession + 'static,
    D: DeviceDiscovery<Device = S::Device> + 'static,
{
    pub fn new(
        coordinator: Arc<Coordinator<S, D>>,
        mqtt_client: MqttClient,
        mqtt_event_loop: rumqttc::EventLoop,
    ) -> Self {
        Manager {
            coordinator,
            mqtt_client,
            mqtt_event_loop,
        }
    }

    pub async fn run_loop(self) -> anyhow::Result<()> {
        let Manager {
            coordinator,
            mqtt_client,
            mut mqtt_event_loop,
        } = self;

        let (tx, mut messages) = broadcast::channel(10);

        // Handle incoming MQTT messages (commands from Home Assistant)
        let listener = mqtt_client.clone();
        tokio::task::spawn(async move {
            listener.event_loop(&mut mqtt_event_loop, tx).await;
        });

        let mut notices = coordinator.subscribe();
        coordinator.start();

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                notice = notices.recv() => match notice {
                    Ok(notice) => {
                        if let UpdateNotice::Failed(reason) = &notice {
                            debug!("Publishing failed update: {}", reason);
                        }
                        publish(&coordinator, &mqtt_client);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        debug!("Update receiver lagged");
                        publish(&coordinator, &mqtt_client);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                message = messages.recv() => match message {
                    Ok(MqttAnnouncement::Command(command)) => handle_command(&coordinator, command).await,
                    Ok(MqttAnnouncement::HomeAssistantOnline) => {
                        let outcome = coordinator.request_refresh().await;
                        debug!("Refresh for Home Assistant: {:?}", outcome);
                        if outcome == RefreshOutcome::Skipped {
                            publish(&coordinator, &mqtt_client);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        debug!("MQTT receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        error!("MQTT event loop exited");
                        break;
                    }
                },
                _ = &mut shutdown => {
                    info!("Shutting down");
                    break;
                }
            }
        }

        coordinator.shutdown().await;
        if let Err(err) = mqtt_client.publish_availability(false) {
            warn!("Error publishing availability: {:?}", err);
        }
        if let Err(err) = mqtt_client.disconnect() {
            warn!("Error disconnecting from MQTT: {:?}", err);
        }

        Ok(())
    }
}

fn publish<S, D>(coordinator: &Coordinator<S, D>, mqtt_client: &MqttClient)
where
    S: MowerSession,
    D: DeviceDiscovery<Device = S::Device>,
{
    let snapshot = coordinator.last_snapshot();
    if let Err(err) = mqtt_client.publish_state(snapshot.as_ref(), coordinator.available()) {
        error!("Error publishing mower state: {:?}", err);
    }
}

async fn handle_command<S, D>(coordinator: &Coordinator<S, D>, command: MowerCommand)
where
    S: MowerSession,
    D: DeviceDiscovery<Device = S::Device>,
{
    info!("Received {:?} for {}", command, coordinator.address());
    match coordinator.execute(command).await {
        Ok(RefreshOutcome::Failed(reason)) => {
            warn!("{:?} sent but refresh failed: {}", command, reason)
        }
        Ok(outcome) => debug!("{:?} done, refresh: {:?}", command, outcome),
        Err(err) => error!("Error running {:?}: {}", command, err),
    }
}

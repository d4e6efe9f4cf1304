//! Entity and partition metadata over the `$management` node.

use super::request_response::RequestResponseChannel;
use crate::auth::TokenProvider;
use crate::common::AmqpResult;
use crate::connection::{Connection, MANAGEMENT_SESSION_NAME};
use crate::message::AmqpMessage;
use crate::model::{EventHubProperties, PartitionProperties};
use std::sync::Arc;
use std::time::Duration;

/// Address of the management node.
pub const MANAGEMENT_ADDRESS: &str = "$management";

pub const READ_OPERATION: &str = "READ";
pub const EVENT_HUB_ENTITY_TYPE: &str = "com.microsoft:eventhub";
pub const PARTITION_ENTITY_TYPE: &str = "com.microsoft:partition";

/// Management channel bound to a connection's `mgmt-session`.
pub struct ManagementChannel {
    channel: RequestResponseChannel,
    token_provider: Arc<dyn TokenProvider>,
    entity_path: String,
    audience: String,
    token_validity: Duration,
    operation_timeout: Duration,
}

impl ManagementChannel {
    pub async fn open(connection: &Arc<Connection>) -> AmqpResult<Self> {
        let channel =
            RequestResponseChannel::open(connection, MANAGEMENT_SESSION_NAME, MANAGEMENT_ADDRESS)
                .await?;
        Ok(Self {
            channel,
            token_provider: connection.token_provider(),
            entity_path: connection.entity_path().to_string(),
            audience: connection.audience(),
            token_validity: connection.options().token_validity(),
            operation_timeout: connection.options().operation_timeout(),
        })
    }

    pub fn entity_path(&self) -> &str {
        &self.entity_path
    }

    async fn read(&self, entity_type: &str, partition: Option<&str>) -> AmqpResult<AmqpMessage> {
        let token = self
            .token_provider
            .get_token(&self.audience, self.token_validity)
            .await?;

        let mut request = AmqpMessage::new()
            .with_application_property("operation", READ_OPERATION)
            .with_application_property("type", entity_type)
            .with_application_property("name", self.entity_path.as_str())
            .with_application_property("security_token", token.token);
        if let Some(partition) = partition {
            request = request.with_application_property("partition", partition);
        }

        self.channel
            .send_with_timeout(request, self.operation_timeout)
            .await
    }

    /// Reads the event hub's name, creation time and partition ids.
    pub async fn get_entity_properties(&self) -> AmqpResult<EventHubProperties> {
        let reply = self.read(EVENT_HUB_ENTITY_TYPE, None).await?;
        EventHubProperties::try_from(&reply.body)
    }

    /// Reads sequence and offset information for one partition.
    pub async fn get_partition_properties(
        &self,
        partition_id: &str,
    ) -> AmqpResult<PartitionProperties> {
        let reply = self.read(PARTITION_ENTITY_TYPE, Some(partition_id)).await?;
        PartitionProperties::try_from(&reply.body)
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    pub async fn close(&self) {
        self.channel.close().await;
    }
}

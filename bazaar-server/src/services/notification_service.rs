use std::{fmt, sync::Arc};

use tracing::instrument;
use uuid::Uuid;

use shared::{
    models::{NewNotification, Notification},
    realtime::{ChannelName, events},
};

use crate::{
    db::NotificationStore,
    realtime::{Transport, publish_best_effort},
};

use super::error::{ServiceError, ServiceResult};

#[derive(Clone)]
pub struct NotificationService {
    store: Arc<dyn NotificationStore>,
    transport: Arc<dyn Transport>,
}

impl fmt::Debug for NotificationService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationService").finish()
    }
}

impl NotificationService {
    pub fn new(store: Arc<dyn NotificationStore>, transport: Arc<dyn Transport>) -> Self {
        Self { store, transport }
    }

    /// Stores a notification and pushes it to the recipient's channel.
    #[instrument(name = "notifications.create", skip(self, notification), fields(recipient = %notification.recipient_id), err)]
    pub async fn create(&self, notification: NewNotification) -> ServiceResult<Notification> {
        let created = self.store.create_notification(notification).await?;
        publish_best_effort(
            self.transport.as_ref(),
            ChannelName::Notifications(created.recipient_id),
            events::NOTIFICATION,
            &created,
        )
        .await;
        Ok(created)
    }

    #[instrument(name = "notifications.list", skip(self), err)]
    pub async fn list(&self, user_id: Uuid) -> ServiceResult<Vec<Notification>> {
        Ok(self.store.list_notifications(user_id).await?)
    }

    #[instrument(name = "notifications.mark_read", skip(self), err)]
    pub async fn mark_read(&self, user_id: Uuid, notification_id: Uuid) -> ServiceResult<()> {
        if self
            .store
            .mark_notification_read(user_id, notification_id)
            .await?
        {
            Ok(())
        } else {
            Err(ServiceError::not_found("notification"))
        }
    }

    #[instrument(name = "notifications.mark_all_read", skip(self), err)]
    pub async fn mark_all_read(&self, user_id: Uuid) -> ServiceResult<u64> {
        Ok(self.store.mark_all_notifications_read(user_id).await?)
    }

    #[instrument(name = "notifications.delete", skip(self), err)]
    pub async fn delete(&self, user_id: Uuid, notification_id: Uuid) -> ServiceResult<()> {
        if self.store.delete_notification(user_id, notification_id).await? {
            Ok(())
        } else {
            Err(ServiceError::not_found("notification"))
        }
    }
}

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Notification topics. Every committed event fans out on exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Hold and booking lifecycle changes.
    Bookings,
    /// Settings and season rule changes.
    Rates,
    /// Invoice issuance and status changes.
    Invoices,
}

pub fn topic_for(event: &Event) -> Topic {
    match event {
        Event::SettingsUpdated { .. }
        | Event::SeasonAdded { .. }
        | Event::SeasonUpdated { .. }
        | Event::SeasonRemoved { .. } => Topic::Rates,
        Event::HoldPlaced { .. }
        | Event::HoldReleased { .. }
        | Event::BookingConfirmed { .. }
        | Event::BookingCheckedIn { .. }
        | Event::BookingCompleted { .. }
        | Event::BookingCancelled { .. } => Topic::Bookings,
        Event::InvoiceIssued { .. } | Event::InvoiceStatusChanged { .. } => Topic::Invoices,
    }
}

/// In-process broadcast hub for committed events, fanned out by topic.
/// Slow or absent subscribers never hold up a commit.
pub struct NotifyHub {
    channels: DashMap<Topic, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a topic. Creates the channel if needed.
    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(topic)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish an event on its topic. No-op if nobody is listening.
    pub fn send(&self, event: &Event) {
        if let Some(sender) = self.channels.get(&topic_for(event)) {
            let _ = sender.send(event.clone());
        }
    }
}

// vf-eventsub: Twitch EventSub surface — webhook intake and subscription
// egress.
//
// The webhook side verifies HMAC signatures and dispatches decoded events
// to registered handlers; the client side creates `stream.online` /
// `stream.offline` subscriptions with an auto-refreshing app token.

pub mod client;
pub mod events;
pub mod webhooks;

pub use client::{ClientCreds, Condition, EventSub, EventSubError, Subscription, Transport};
pub use events::{EventStreamOffline, EventStreamOnline};
pub use webhooks::{RevocationPayload, WebhookDispatch, WebhookHeaders};

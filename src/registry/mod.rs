/*
 * Service Registries
 *
 * Process-wide tables owned by the channel, each behind its own lock:
 * - callback: anonymous (in-process) services keyed by token
 * - death: death-notification subscriptions keyed by remote handle
 * - worker: looper threads and the handler each one runs
 */

pub mod callback;
pub mod death;
pub mod worker;

pub use callback::CallbackRegistry;
pub use death::{DeathRegistry, MAX_DEATH_CALLBACKS, Subscribed, Unsubscribed};
pub use worker::WorkerPool;

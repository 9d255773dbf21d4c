//! Two-state machine driving a plugin's activation hooks.

use crate::Error;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use vipd_plugin::Plugin;

/// Local role of an endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum State {
    /// Not serving the resource.
    Standby,

    /// Serving the resource.
    Activated,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standby => f.write_str("STANDBY"),
            Self::Activated => f.write_str("ACTIVATED"),
        }
    }
}

/// Something that happened to the endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    /// The lock was won.
    Elected,

    /// Ownership was given up or lost.
    Demoted,

    /// Activation must be re-run without a fresh election.
    Fault,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Elected => f.write_str("elected"),
            Self::Demoted => f.write_str("demoted"),
            Self::Fault => f.write_str("fault"),
        }
    }
}

/// Side effect of entering a state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Effect {
    /// Run the plugin's activation hook.
    Activate,

    /// Run the plugin's deactivation hook.
    Deactivate,
}

/// The transition table. `None` means the event is rejected.
#[must_use]
pub const fn transition(state: State, event: Event) -> Option<(State, Effect)> {
    match (state, event) {
        (State::Standby, Event::Elected) | (State::Standby | State::Activated, Event::Fault) => {
            Some((State::Activated, Effect::Activate))
        }
        (State::Activated, Event::Demoted) => Some((State::Standby, Effect::Deactivate)),
        (State::Standby, Event::Demoted) | (State::Activated, Event::Elected) => None,
    }
}

/// Result of an accepted event.
#[derive(Debug)]
pub struct Transition {
    /// State before the event.
    pub from: State,

    /// State after the event.
    pub to: State,

    /// Outcome of the hook that ran on entry. A failed or overrunning hook
    /// does not undo the transition.
    pub hook: Result<(), vipd_plugin::Error>,
}

/// Applies events one at a time, running the plugin hook of each entered
/// state before the next event is looked at.
pub struct StateMachine {
    plugin: Arc<dyn Plugin>,
    hook_timeout: Duration,
    state: Mutex<State>,
    published: watch::Sender<State>,
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("state", &*self.published.borrow())
            .finish_non_exhaustive()
    }
}

impl StateMachine {
    /// Creates a machine in [`State::Standby`]. Hooks running longer than
    /// `hook_timeout` are abandoned and reported as failed.
    pub fn new(plugin: Arc<dyn Plugin>, hook_timeout: Duration) -> Self {
        let (published, _) = watch::channel(State::Standby);

        Self {
            plugin,
            hook_timeout,
            state: Mutex::new(State::Standby),
            published,
        }
    }

    /// The state after the last completed transition.
    pub fn state(&self) -> State {
        *self.published.borrow()
    }

    /// Observes completed transitions.
    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.published.subscribe()
    }

    /// Applies `event`, running the entered state's hook.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the event is not valid in the
    /// current state. The state is left unchanged.
    pub async fn fire(&self, event: Event) -> Result<Transition, Error> {
        let mut state = self.state.lock().await;
        let from = *state;

        let (to, effect) =
            transition(from, event).ok_or(Error::InvalidTransition { state: from, event })?;

        let (operation, hook) = match effect {
            Effect::Activate => ("activate", self.plugin.activate()),
            Effect::Deactivate => ("disable", self.plugin.disable()),
        };
        let hook = tokio::time::timeout(self.hook_timeout, hook)
            .await
            .unwrap_or_else(|elapsed| Err(vipd_plugin::Error::failed(operation, elapsed)));

        *state = to;
        self.published.send_replace(to);

        Ok(Transition { from, to, hook })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use vipd_plugin::PluginFactory;
    use vipd_plugin_mock::{MockFactory, MockState};

    const HOOK_TIMEOUT: Duration = Duration::from_secs(5);

    async fn machine() -> (StateMachine, Arc<MockState>) {
        let factory = MockFactory::new();
        let endpoint =
            vipd_model::Endpoint::new("mock", serde_json::json!({ "key": "k1" }));
        let plugin = factory.create(&endpoint).await.unwrap();

        (
            StateMachine::new(plugin, HOOK_TIMEOUT),
            factory.state(&endpoint.id),
        )
    }

    /// Plugin whose hooks never finish.
    struct Stuck;

    #[async_trait]
    impl Plugin for Stuck {
        async fn activate(&self) -> Result<(), vipd_plugin::Error> {
            std::future::pending().await
        }

        async fn disable(&self) -> Result<(), vipd_plugin::Error> {
            std::future::pending().await
        }

        async fn ensure(&self) -> Result<(), vipd_plugin::Error> {
            Ok(())
        }

        fn election_key(&self) -> String {
            "stuck".to_string()
        }
    }

    #[test]
    fn test_transition_table() {
        assert_eq!(
            transition(State::Standby, Event::Elected),
            Some((State::Activated, Effect::Activate))
        );
        assert_eq!(
            transition(State::Activated, Event::Demoted),
            Some((State::Standby, Effect::Deactivate))
        );
        assert_eq!(
            transition(State::Standby, Event::Fault),
            Some((State::Activated, Effect::Activate))
        );
        assert_eq!(
            transition(State::Activated, Event::Fault),
            Some((State::Activated, Effect::Activate))
        );
        assert_eq!(transition(State::Standby, Event::Demoted), None);
        assert_eq!(transition(State::Activated, Event::Elected), None);
    }

    #[tokio::test]
    async fn test_demoted_from_standby_is_rejected() {
        let (machine, mock) = machine().await;

        assert_matches!(
            machine.fire(Event::Demoted).await,
            Err(Error::InvalidTransition {
                state: State::Standby,
                event: Event::Demoted
            })
        );
        assert_eq!(machine.state(), State::Standby);
        assert_eq!(mock.disables(), 0);
    }

    #[tokio::test]
    async fn test_elected_and_fault_activate_once_each() {
        let (machine, mock) = machine().await;

        let elected = machine.fire(Event::Elected).await.unwrap();
        assert_eq!((elected.from, elected.to), (State::Standby, State::Activated));
        assert_eq!(mock.activations(), 1);

        machine.fire(Event::Demoted).await.unwrap();
        assert_eq!(mock.disables(), 1);

        let fault = machine.fire(Event::Fault).await.unwrap();
        assert_eq!((fault.from, fault.to), (State::Standby, State::Activated));
        assert_eq!(mock.activations(), 2);

        machine.fire(Event::Fault).await.unwrap();
        assert_eq!(machine.state(), State::Activated);
        assert_eq!(mock.activations(), 3);
    }

    #[tokio::test]
    async fn test_failed_hook_still_transitions() {
        let (machine, mock) = machine().await;
        mock.set_fail_activate(true);

        let transition = machine.fire(Event::Elected).await.unwrap();

        assert!(transition.hook.is_err());
        assert_eq!(machine.state(), State::Activated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrunning_hooks_time_out() {
        let machine = StateMachine::new(Arc::new(Stuck), HOOK_TIMEOUT);
        let started = tokio::time::Instant::now();

        let elected = machine.fire(Event::Elected).await.unwrap();
        assert_matches!(
            elected.hook,
            Err(vipd_plugin::Error::Failed {
                operation: "activate",
                ..
            })
        );
        assert_eq!(machine.state(), State::Activated);

        let demoted = machine.fire(Event::Demoted).await.unwrap();
        assert_matches!(
            demoted.hook,
            Err(vipd_plugin::Error::Failed {
                operation: "disable",
                ..
            })
        );
        assert_eq!(machine.state(), State::Standby);
        assert!(started.elapsed() >= HOOK_TIMEOUT * 2);
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let (machine, _) = machine().await;
        let mut states = machine.subscribe();

        machine.fire(Event::Elected).await.unwrap();

        states.changed().await.unwrap();
        assert_eq!(*states.borrow(), State::Activated);
    }
}

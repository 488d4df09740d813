/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Offload decoder life cycle

/// Per-stream state of the offload path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffloadState {
    #[default]
    Uninit,
    /// Rings allocated and decoder context started
    Configured,
    Running,
    /// Input ran dry; silence is returned until frames arrive again
    UnderflowRecovery,
    Teardown,
}

/// Events that move the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffloadEvent {
    Configured,
    OutputDelivered,
    InputStarved,
    FramesAvailable,
    Shutdown,
}

impl OffloadState {
    /// Next state after `event`. Events that do not apply leave the state unchanged.
    pub fn on_event(self, event: OffloadEvent) -> OffloadState {
        use OffloadEvent as E;
        use OffloadState as S;
        match (self, event) {
            (_, E::Shutdown) => S::Teardown,
            (S::Teardown, _) => S::Teardown,
            (S::Uninit, E::Configured) => S::Configured,
            (S::Configured | S::Running, E::OutputDelivered) => S::Running,
            (S::Configured | S::Running, E::InputStarved) => S::UnderflowRecovery,
            (S::UnderflowRecovery, E::FramesAvailable | E::OutputDelivered) => S::Running,
            (state, _) => state,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            OffloadState::Configured | OffloadState::Running | OffloadState::UnderflowRecovery
        )
    }
}

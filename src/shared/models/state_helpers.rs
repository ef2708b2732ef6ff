use super::container::ContainerState;

pub fn can_transition_to(from: ContainerState, to: ContainerState) -> bool {
    use ContainerState::*;
    matches!(
        (from, to),
        (Provisioning, Running)
            | (Running, Stopping)
            | (Running, Stopped)
            | (Stopped, Running)
            | (Stopped, Stopping)
            | (Stopping, Stopped)
    )
}

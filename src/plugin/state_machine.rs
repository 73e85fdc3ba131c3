//! 插件生命周期状态机
//!
//! 合法迁移：
//! - Absent → Installing → Installed
//! - Installed → Updating → Installed
//! - Installed → Uninstalling → Absent
//! - 任意瞬态 → Failed
//! - Failed → Installing / Updating（重试）
//! - Failed → Absent（卸载清理）
//!
//! 其余迁移均为调用方契约错误，由注册表在写入前拒绝。

use super::types::PluginState;

/// 生命周期状态机
pub struct LifecycleStateMachine;

impl LifecycleStateMachine {
    /// 检查迁移是否合法
    pub fn can_transition(from: PluginState, to: PluginState) -> bool {
        use PluginState::*;

        match (from, to) {
            (Absent, Installing)
            | (Installing, Installed)
            | (Installed, Updating)
            | (Updating, Installed)
            | (Installed, Uninstalling)
            | (Uninstalling, Absent)
            | (Failed, Installing)
            | (Failed, Updating)
            | (Failed, Absent) => true,
            (from, Failed) => from.is_transient(),
            _ => false,
        }
    }

    /// 某状态下允许进入的下一状态
    pub fn successors(from: PluginState) -> Vec<PluginState> {
        PluginState::ALL
            .into_iter()
            .filter(|to| Self::can_transition(from, *to))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use PluginState::*;

    #[test]
    fn test_install_path() {
        assert!(LifecycleStateMachine::can_transition(Absent, Installing));
        assert!(LifecycleStateMachine::can_transition(Installing, Installed));
        assert!(!LifecycleStateMachine::can_transition(Absent, Installed));
    }

    #[test]
    fn test_update_and_uninstall_paths() {
        assert!(LifecycleStateMachine::can_transition(Installed, Updating));
        assert!(LifecycleStateMachine::can_transition(Updating, Installed));
        assert!(LifecycleStateMachine::can_transition(Installed, Uninstalling));
        assert!(LifecycleStateMachine::can_transition(Uninstalling, Absent));
        assert!(!LifecycleStateMachine::can_transition(Updating, Absent));
        assert!(!LifecycleStateMachine::can_transition(Installing, Absent));
    }

    #[test]
    fn test_failed_transitions() {
        assert_eq!(
            LifecycleStateMachine::successors(Failed),
            vec![Absent, Installing, Updating]
        );
        assert!(!LifecycleStateMachine::can_transition(Failed, Installed));
        assert!(!LifecycleStateMachine::can_transition(Installed, Failed));
        assert!(!LifecycleStateMachine::can_transition(Absent, Failed));
    }

    fn arb_state() -> impl Strategy<Value = PluginState> {
        prop::sample::select(PluginState::ALL.to_vec())
    }

    proptest! {
        /// 不存在自环迁移
        #[test]
        fn prop_no_self_transitions(state in arb_state()) {
            prop_assert!(!LifecycleStateMachine::can_transition(state, state));
        }

        /// 每个瞬态都能到达 Failed，每个稳定态都不能直接进入 Failed
        #[test]
        fn prop_failed_reachable_only_from_transient(state in arb_state()) {
            prop_assert_eq!(
                LifecycleStateMachine::can_transition(state, Failed),
                state.is_transient()
            );
        }

        /// 稳定态之间不存在直接迁移（Failed → Absent 清理除外）
        #[test]
        fn prop_stable_states_go_through_transient(from in arb_state(), to in arb_state()) {
            if !from.is_transient() && !to.is_transient()
                && LifecycleStateMachine::can_transition(from, to)
            {
                prop_assert_eq!((from, to), (Failed, Absent));
            }
        }
    }
}

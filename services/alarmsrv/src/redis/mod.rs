//! Redis-backed collaborators
//!
//! Key layout under the configured prefix:
//!
//! | key                                   | type | content                         |
//! |---------------------------------------|------|---------------------------------|
//! | `{prefix}:state:{topic}.{partition}`  | hash | `tenant:entity` → state JSON    |
//! | `{prefix}:queue:{topic}.{partition}`  | list | pending alarm rules records     |
//! | `{prefix}:inflight:{topic}.{partition}` | list | polled, uncommitted records   |
//! | `{prefix}:alarms`                     | pub/sub channel | alarm event JSON     |

mod pool;
mod queue;
mod sink;
mod state_store;

pub use pool::{connect, RedisPool};
pub use queue::{RedisQueueConsumer, RedisQueueProducer};
pub use sink::RedisAlarmSink;
pub use state_store::RedisStateStore;

use voltage_alarm::TopicPartitionInfo;

/// Redis key names for one prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn state(&self, tpi: &TopicPartitionInfo) -> String {
        format!("{}:state:{}", self.prefix, tpi)
    }

    pub fn queue(&self, tpi: &TopicPartitionInfo) -> String {
        format!("{}:queue:{}", self.prefix, tpi)
    }

    pub fn in_flight(&self, tpi: &TopicPartitionInfo) -> String {
        format!("{}:inflight:{}", self.prefix, tpi)
    }

    pub fn alarms(&self) -> String {
        format!("{}:alarms", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = KeySpace::new("alarmsrv");
        let tpi = TopicPartitionInfo::new("tb_alarm_rules", 3);
        assert_eq!(keys.state(&tpi), "alarmsrv:state:tb_alarm_rules.3");
        assert_eq!(keys.queue(&tpi), "alarmsrv:queue:tb_alarm_rules.3");
        assert_eq!(keys.in_flight(&tpi), "alarmsrv:inflight:tb_alarm_rules.3");
        assert_eq!(keys.alarms(), "alarmsrv:alarms");
    }
}

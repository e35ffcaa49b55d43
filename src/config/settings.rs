use serde::Deserialize;

/// Top-level configuration settings for the consumer.
///
/// Includes the broker connection, the subscription set and logging.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub consumer: ConsumerSettings,
    pub log: LogSettings,
}

/// Where and as whom to connect.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub address: String,
    pub client_id: String,
    pub username: String,
    pub password: String,
}

/// Which topics to subscribe to and how hard to try redelivering.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub topics: Vec<String>,
    pub max_redeliveries: u32,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled from
/// `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub consumer: Option<PartialConsumerSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub address: Option<String>,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialConsumerSettings {
    pub topics: Option<Vec<String>>,
    pub max_redeliveries: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings {
                address: "ws://127.0.0.1:8080".to_string(),
                client_id: "client2".to_string(),
                username: "admin".to_string(),
                password: "password".to_string(),
            },
            consumer: ConsumerSettings {
                topics: vec!["News".to_string()],
                max_redeliveries: 5,
            },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl PartialSettings {
    /// Overlays whatever was specified onto `defaults`.
    pub fn merge(self, defaults: Settings) -> Settings {
        let broker = self.broker.unwrap_or_default();
        let consumer = self.consumer.unwrap_or_default();
        let log = self.log.unwrap_or_default();

        Settings {
            broker: BrokerSettings {
                address: broker.address.unwrap_or(defaults.broker.address),
                client_id: broker.client_id.unwrap_or(defaults.broker.client_id),
                username: broker.username.unwrap_or(defaults.broker.username),
                password: broker.password.unwrap_or(defaults.broker.password),
            },
            consumer: ConsumerSettings {
                topics: consumer
                    .topics
                    .filter(|topics| !topics.is_empty())
                    .unwrap_or(defaults.consumer.topics),
                max_redeliveries: consumer
                    .max_redeliveries
                    .unwrap_or(defaults.consumer.max_redeliveries),
            },
            log: LogSettings {
                level: log.level.unwrap_or(defaults.log.level),
            },
        }
    }
}

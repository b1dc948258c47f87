use lapin::{Connection, ConnectionProperties};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};

use super::errors::{RabbitMQError, Result};

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Dials the broker, cycling through candidate URLs with exponential backoff.
pub struct ConnectionManager {
    urls: Vec<String>,
    next_url: usize,
    connection_name: String,
    reconnect_attempts: u32,
    max_reconnect_attempts: u32,
    reconnect_delay: Duration,
}

impl ConnectionManager {
    pub fn new(urls: Vec<String>, connection_name: &str) -> Self {
        ConnectionManager {
            urls,
            next_url: 0,
            connection_name: connection_name.to_string(),
            reconnect_attempts: 0,
            max_reconnect_attempts: 0,
            reconnect_delay: Duration::from_secs(2),
        }
    }

    /// `max_attempts == 0` keeps trying forever.
    pub fn with_reconnect_policy(mut self, max_attempts: u32, initial_delay: Duration) -> Self {
        self.max_reconnect_attempts = max_attempts;
        self.reconnect_delay = initial_delay;
        self
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    fn next_url(&mut self) -> Option<String> {
        if self.urls.is_empty() {
            return None;
        }
        let url = self.urls[self.next_url % self.urls.len()].clone();
        self.next_url = (self.next_url + 1) % self.urls.len();
        Some(url)
    }

    /// Connects to the first reachable URL. Returns the connection and the
    /// URL it was made to.
    pub async fn establish_connection(&mut self) -> Result<(Connection, String)> {
        self.reconnect_attempts = 0;
        let mut delay = self.reconnect_delay;

        loop {
            let url = match self.next_url() {
                Some(url) => url,
                None => {
                    return Err(RabbitMQError::ConnectionError(
                        "no broker URLs configured".to_string(),
                    ))
                }
            };
            info!(host = %redact(&url), "Attempting to connect to RabbitMQ");

            let properties = ConnectionProperties::default().with_connection_name(self.connection_name.clone().into());

            match Connection::connect(&url, properties).await {
                Ok(conn) => {
                    info!(host = %redact(&url), "Successfully connected to RabbitMQ");
                    self.reconnect_attempts = 0;
                    return Ok((conn, url));
                }
                Err(err) => {
                    self.reconnect_attempts += 1;
                    error!(
                        "Failed to connect to RabbitMQ (attempt {}/{}): {:?}",
                        self.reconnect_attempts,
                        if self.max_reconnect_attempts == 0 {
                            "unlimited".to_string()
                        } else {
                            self.max_reconnect_attempts.to_string()
                        },
                        err
                    );

                    if self.max_reconnect_attempts != 0 && self.reconnect_attempts >= self.max_reconnect_attempts {
                        error!("Max reconnection attempts reached. Giving up.");
                        return Err(RabbitMQError::ConnectionError(err.to_string()));
                    }

                    let sleep_time = jittered(delay);
                    info!("Waiting {}ms before next reconnect attempt", sleep_time.as_millis());
                    sleep(sleep_time).await;

                    delay = std::cmp::min(delay * 2, MAX_RECONNECT_DELAY);
                }
            }
        }
    }
}

/// ±15% jitter.
fn jittered(delay: Duration) -> Duration {
    let factor = 1.0 + (rand::random::<f64>() * 0.3 - 0.15);
    delay.mul_f64(factor)
}

/// Hides credentials when logging a URL.
pub(crate) fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

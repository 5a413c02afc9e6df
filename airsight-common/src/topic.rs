use crate::error::{Error, Result};

/// Default topic prefix used by Qingping devices in private-cloud mode.
pub const TOPIC_PREFIX: &str = "qingping";

/// Direction of a device topic, seen from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device → bridge (readings, acknowledgements).
    Up,
    /// Bridge → device (commands).
    Down,
}

impl Direction {
    /// Topic suffix for this direction.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

/// Topics for a single device.
///
/// Topics follow the pattern `<prefix>/<device-address>/<up|down>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopics {
    prefix: String,
    address: String,
}

impl DeviceTopics {
    /// Create topics for a device address with the default prefix.
    pub fn new(address: impl Into<String>) -> Self {
        Self::with_prefix(TOPIC_PREFIX, address)
    }

    /// Create topics with a custom prefix.
    pub fn with_prefix(prefix: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            address: address.into(),
        }
    }

    /// The transport-level device address (MAC).
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Build the topic for a direction.
    ///
    /// # Example
    /// ```
    /// use airsight_common::topic::{DeviceTopics, Direction};
    ///
    /// let topics = DeviceTopics::new("582D34123456");
    /// assert_eq!(topics.build(Direction::Up), "qingping/582D34123456/up");
    /// ```
    pub fn build(&self, direction: Direction) -> String {
        format!("{}/{}/{}", self.prefix, self.address, direction.as_str())
    }

    /// Topic the device publishes readings on.
    pub fn up(&self) -> String {
        self.build(Direction::Up)
    }

    /// Topic the device listens on for commands.
    pub fn down(&self) -> String {
        self.build(Direction::Down)
    }

    /// Check whether a parsed topic belongs to this device.
    pub fn owns(&self, parsed: &ParsedTopic) -> bool {
        parsed.prefix == self.prefix && parsed.address.eq_ignore_ascii_case(&self.address)
    }
}

/// Parsed components of a device topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic {
    pub prefix: String,
    pub address: String,
    pub direction: Direction,
}

/// Parse a device topic into its components.
///
/// The prefix may itself contain `/`; the last two segments are always the
/// device address and the direction.
///
/// # Example
/// ```
/// use airsight_common::topic::{parse_topic, Direction};
///
/// let parsed = parse_topic("qingping/582D34123456/up").unwrap();
/// assert_eq!(parsed.address, "582D34123456");
/// assert_eq!(parsed.direction, Direction::Up);
/// ```
pub fn parse_topic(topic: &str) -> Result<ParsedTopic> {
    let mut parts = topic.rsplitn(3, '/');

    let direction = match parts.next() {
        Some("up") => Direction::Up,
        Some("down") => Direction::Down,
        _ => {
            return Err(Error::Topic(format!(
                "'{}' does not end with /up or /down",
                topic
            )));
        }
    };

    let address = parts
        .next()
        .filter(|a| !a.is_empty())
        .ok_or_else(|| Error::Topic(format!("'{}' has no device address", topic)))?;

    let prefix = parts
        .next()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| Error::Topic(format!("'{}' has no prefix", topic)))?;

    Ok(ParsedTopic {
        prefix: prefix.to_string(),
        address: address.to_string(),
        direction,
    })
}

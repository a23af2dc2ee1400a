use std::str::FromStr;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::SerialConfig;
use crate::discovery::ControllerBindings;
use crate::error::LinkError;
use crate::link::{Command, CommandResponse, ControllerLink};

/// Wire verbs understood by the two controllers.
const VERB_COMPACT: &str = "COMPRESS";
const VERB_SENSORS: &str = "GETD";
const VERB_FLUSH: &str = "FLUSH";
const VERB_RESTART: &str = "RESTART";
const VERB_RESET_DISK: &str = "disk_reset";

/// One of the four sorting compartments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compartment {
    /// Biodegradable and recyclable.
    Br,
    /// Biodegradable and non-recyclable.
    Bnr,
    /// Non-biodegradable and recyclable.
    Nbr,
    /// Non-biodegradable and non-recyclable.
    Nbnr,
}

impl Compartment {
    pub const ALL: [Compartment; 4] =
        [Compartment::Br, Compartment::Bnr, Compartment::Nbr, Compartment::Nbnr];

    /// The compartment-open verb on the mechanism controller.
    pub fn verb(&self) -> &'static str {
        match self {
            Compartment::Br => "BR",
            Compartment::Bnr => "BNR",
            Compartment::Nbr => "NBR",
            Compartment::Nbnr => "NBNR",
        }
    }

    /// The canonical classification label routed to this compartment.
    pub fn category_label(&self) -> &'static str {
        match self {
            Compartment::Br => "Bio Degradable and Recyclable",
            Compartment::Bnr => "Bio Degradable and Non Recyclable",
            Compartment::Nbr => "Non Bio Degradable and Recyclable",
            Compartment::Nbnr => "Non Bio Degradable and Non Recyclable",
        }
    }

    /// Exact-match lookup from a classification category to a compartment.
    ///
    /// Only a simple trim is applied; case differences, internal whitespace
    /// variations, and unknown labels yield no route. An unmapped category
    /// must be treated as a retryable classification error, never routed to
    /// a default compartment.
    pub fn for_category(category: &str) -> Option<Compartment> {
        let trimmed = category.trim();
        Compartment::ALL
            .into_iter()
            .find(|c| c.category_label() == trimmed)
    }
}

impl std::fmt::Display for Compartment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.verb())
    }
}

/// One fill-level snapshot: exactly four integers, ordered BR, BNR, NBR,
/// NBNR, as the mechanism controller reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorReading {
    pub br: i32,
    pub bnr: i32,
    pub nbr: i32,
    pub nbnr: i32,
}

impl SensorReading {
    pub fn level(&self, compartment: Compartment) -> i32 {
        match compartment {
            Compartment::Br => self.br,
            Compartment::Bnr => self.bnr,
            Compartment::Nbr => self.nbr,
            Compartment::Nbnr => self.nbnr,
        }
    }

    pub fn as_array(&self) -> [i32; 4] {
        [self.br, self.bnr, self.nbr, self.nbnr]
    }

    pub fn max_level(&self) -> i32 {
        self.as_array().into_iter().max().unwrap_or(0)
    }
}

impl FromStr for SensorReading {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let values: Vec<i32> = line
            .split(',')
            .map(|part| part.trim().parse::<i32>())
            .collect::<Result<_, _>>()
            .map_err(|e| format!("non-integer field in {line:?}: {e}"))?;

        match values.as_slice() {
            [br, bnr, nbr, nbnr] => Ok(SensorReading {
                br: *br,
                bnr: *bnr,
                nbr: *nbr,
                nbnr: *nbnr,
            }),
            _ => Err(format!("expected 4 fields, got {} in {line:?}", values.len())),
        }
    }
}

impl std::fmt::Display for SensorReading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{},{},{}", self.br, self.bnr, self.nbr, self.nbnr)
    }
}

/// Typed command surface over the two controller links.
///
/// Owns both bindings exclusively for the session; dropping the gateway
/// closes both ports, after which discovery must run again.
pub struct CommandGateway {
    stepper: ControllerLink,
    mechanism: ControllerLink,
    command_timeout: Duration,
    sensor_timeout: Duration,
}

impl CommandGateway {
    pub fn new(bindings: ControllerBindings, config: &SerialConfig) -> Self {
        Self {
            stepper: bindings.stepper,
            mechanism: bindings.mechanism,
            command_timeout: Duration::from_millis(config.command_timeout_ms),
            sensor_timeout: Duration::from_millis(config.sensor_timeout_ms),
        }
    }

    pub fn stepper_port(&self) -> &str {
        self.stepper.port_name()
    }

    pub fn mechanism_port(&self) -> &str {
        self.mechanism.port_name()
    }

    /// Open the compartment for the given category.
    pub fn open_compartment(&mut self, compartment: Compartment) -> Result<String, LinkError> {
        info!(%compartment, "opening compartment");
        Self::require_ack(
            &mut self.mechanism,
            &Command::new(compartment.verb()),
            self.command_timeout,
        )
    }

    /// Run the compaction stepper before routing the item.
    pub fn run_compaction(&mut self) -> Result<String, LinkError> {
        info!("running compaction");
        Self::require_ack(&mut self.stepper, &Command::new(VERB_COMPACT), self.command_timeout)
    }

    /// Poll the fill-level sensors.
    ///
    /// The controller aggregates several physical reads before replying, so
    /// this uses the longer sensor timeout. Lines that do not parse as four
    /// integers are dropped and the read retried within the same budget;
    /// exhausting the budget yields `None`, which the caller must treat as
    /// "no reading", not as an error.
    pub fn poll_sensors(&mut self) -> Result<Option<SensorReading>, LinkError> {
        debug!("requesting sensor data");
        self.mechanism.write_command(&Command::new(VERB_SENSORS))?;

        let deadline = Instant::now() + self.sensor_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(timeout = ?self.sensor_timeout, "no valid sensor reading within budget");
                return Ok(None);
            }

            match self.mechanism.read_line(remaining)? {
                Some(line) => match line.parse::<SensorReading>() {
                    Ok(reading) => {
                        debug!(levels = %reading, "sensor reading received");
                        return Ok(Some(reading));
                    }
                    Err(e) => {
                        warn!(line = %line, error = %e, "invalid sensor line, retrying read");
                    }
                },
                None => {
                    warn!(timeout = ?self.sensor_timeout, "no valid sensor reading within budget");
                    return Ok(None);
                }
            }
        }
    }

    /// Empty all compartments.
    pub fn flush_all(&mut self) -> Result<String, LinkError> {
        info!("flushing all compartments");
        Self::require_ack(&mut self.mechanism, &Command::new(VERB_FLUSH), self.command_timeout)
    }

    /// Return the sorting mechanism to its home state.
    pub fn restart_mechanism(&mut self) -> Result<String, LinkError> {
        info!("restarting mechanism");
        Self::require_ack(&mut self.mechanism, &Command::new(VERB_RESTART), self.command_timeout)
    }

    /// Re-home the routing disk.
    pub fn reset_disk(&mut self) -> Result<String, LinkError> {
        info!("resetting routing disk");
        Self::require_ack(&mut self.mechanism, &Command::new(VERB_RESET_DISK), self.command_timeout)
    }

    /// Send a command that must be acknowledged; absence of a reply within
    /// the bound escalates to a link timeout.
    fn require_ack(
        link: &mut ControllerLink,
        command: &Command,
        timeout: Duration,
    ) -> Result<String, LinkError> {
        match link.send(command, timeout)? {
            CommandResponse::Line(line) => Ok(line),
            CommandResponse::NoResponse => Err(LinkError::Timeout {
                role: link.role(),
                timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::ControllerRole;
    use crate::testutil::ScriptedPort;

    fn gateway_with(stepper: ScriptedPort, mechanism: ScriptedPort) -> CommandGateway {
        let bindings = ControllerBindings {
            stepper: ControllerLink::new(ControllerRole::Stepper, "/dev/ttyUSB0".into(), Box::new(stepper)),
            mechanism: ControllerLink::new(
                ControllerRole::Mechanism,
                "/dev/ttyUSB1".into(),
                Box::new(mechanism),
            ),
        };
        let config = SerialConfig {
            command_timeout_ms: 50,
            sensor_timeout_ms: 100,
            ..SerialConfig::default()
        };
        CommandGateway::new(bindings, &config)
    }

    #[test]
    fn category_mapping_is_exact_match_only() {
        assert_eq!(
            Compartment::for_category("Bio Degradable and Recyclable"),
            Some(Compartment::Br)
        );
        assert_eq!(
            Compartment::for_category("  Non Bio Degradable and Recyclable \n"),
            Some(Compartment::Nbr)
        );

        // No fuzzy or case-insensitive matching, no default route.
        assert_eq!(Compartment::for_category("bio degradable and recyclable"), None);
        assert_eq!(Compartment::for_category("Bio Degradable  and Recyclable"), None);
        assert_eq!(Compartment::for_category("Hazardous"), None);
        assert_eq!(Compartment::for_category(""), None);
    }

    #[test]
    fn compartment_open_uses_the_mechanism_link() {
        let stepper = ScriptedPort::new();
        let mechanism = ScriptedPort::new();
        mechanism.reply_to("NBR", "OK\n");
        let stepper_writes = stepper.written();
        let mechanism_writes = mechanism.written();

        let mut gateway = gateway_with(stepper, mechanism);
        gateway.open_compartment(Compartment::Nbr).unwrap();

        assert!(stepper_writes.lock().unwrap().is_empty());
        assert_eq!(mechanism_writes.lock().unwrap().as_slice(), ["NBR"]);
    }

    #[test]
    fn compaction_uses_the_stepper_link() {
        let stepper = ScriptedPort::new();
        let mechanism = ScriptedPort::new();
        stepper.reply_to("COMPRESS", "DONE\n");
        let stepper_writes = stepper.written();

        let mut gateway = gateway_with(stepper, mechanism);
        let ack = gateway.run_compaction().unwrap();

        assert_eq!(ack, "DONE");
        assert_eq!(stepper_writes.lock().unwrap().as_slice(), ["COMPRESS"]);
    }

    #[test]
    fn unacknowledged_command_times_out() {
        let stepper = ScriptedPort::new();
        let mechanism = ScriptedPort::new();

        let mut gateway = gateway_with(stepper, mechanism);
        let err = gateway.flush_all().unwrap_err();

        assert!(matches!(err, LinkError::Timeout { role: ControllerRole::Mechanism, .. }));
    }

    #[test]
    fn sensor_reading_parses_exactly_four_integers() {
        let reading: SensorReading = "3,12,0,41".parse().unwrap();
        assert_eq!(reading.as_array(), [3, 12, 0, 41]);
        assert_eq!(reading.level(Compartment::Bnr), 12);
        assert_eq!(reading.max_level(), 41);

        assert!("3,12,0".parse::<SensorReading>().is_err());
        assert!("3,12,0,41,7".parse::<SensorReading>().is_err());
        assert!("3,twelve,0,41".parse::<SensorReading>().is_err());
        assert!("".parse::<SensorReading>().is_err());
    }

    #[test]
    fn poll_sensors_returns_the_reported_levels() {
        let stepper = ScriptedPort::new();
        let mechanism = ScriptedPort::new();
        mechanism.reply_to("GETD", "3,12,0,41\n");

        let mut gateway = gateway_with(stepper, mechanism);
        let reading = gateway.poll_sensors().unwrap().unwrap();
        assert_eq!(reading.as_array(), [3, 12, 0, 41]);
    }

    #[test]
    fn poll_sensors_retries_past_garbage_lines() {
        let stepper = ScriptedPort::new();
        let mechanism = ScriptedPort::new();
        // Controller emits a debug line before the actual reading.
        mechanism.reply_to("GETD", "sensors warming up\n2,3,11,4\n");

        let mut gateway = gateway_with(stepper, mechanism);
        let reading = gateway.poll_sensors().unwrap().unwrap();
        assert_eq!(reading.as_array(), [2, 3, 11, 4]);
    }

    #[test]
    fn poll_sensors_is_none_on_timeout() {
        let stepper = ScriptedPort::new();
        let mechanism = ScriptedPort::new();

        let mut gateway = gateway_with(stepper, mechanism);
        assert_eq!(gateway.poll_sensors().unwrap(), None);
    }
}

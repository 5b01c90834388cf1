// Battery telemetry carried in vendor-specific HFP AT commands. Apple's IPHONEACCEV and
// Plantronics/Poly's XEVENT are supported; both decoders return None for anything malformed.

use log::{info, warn};

/// The AT command type indicated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AtCommandType {
    Set,
    Query,
    Test,
    Execute,
}

// Delimiters for AT commands. Execute has no delimiter.
const AT_COMMAND_DELIMITER_SET: &str = "=";
const AT_COMMAND_DELIMITER_QUERY: &str = "?";
const AT_COMMAND_DELIMITER_TEST: &str = "=?";
const AT_COMMAND_ARG_DELIMITER: &str = ",";

const AT_COMMAND_VENDOR_APPLE: &str = "Apple";
const AT_COMMAND_VENDOR_PLANTRONICS: &str = "Plantronics";

pub const AT_COMMAND_VENDOR_XAPL: &str = "XAPL";
pub const AT_COMMAND_VENDOR_IPHONEACCEV: &str = "IPHONEACCEV";
pub const AT_COMMAND_VENDOR_XEVENT: &str = "XEVENT";

const IPHONEACCEV_BATTERY_LEVEL: i32 = 1;
const XEVENT_BATTERY_LEVEL: &str = "BATTERY";

/// One argument of a vendor command. Numeric arguments are decoded as integers, everything else
/// is kept as text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VendorArg {
    Int(i32),
    Str(String),
}

impl VendorArg {
    fn parse(raw: &str) -> VendorArg {
        match raw.trim().parse::<i32>() {
            Ok(value) => VendorArg::Int(value),
            Err(_) => VendorArg::Str(raw.to_string()),
        }
    }

    fn as_int(&self) -> Option<i32> {
        match self {
            VendorArg::Int(value) => Some(*value),
            VendorArg::Str(_) => None,
        }
    }
}

/// An AT command split into its parts.
#[derive(Clone, Debug, PartialEq)]
pub struct AtCommand {
    // The original, unparsed, AT command
    pub raw: String,
    pub at_type: AtCommandType,
    // The actual command being sent (AT+<command>=?)
    pub command: String,
    pub args: Vec<VendorArg>,
    // For vendor-specific AT commands
    pub vendor: Option<String>,
}

/// Splits an AT command into type, command name and typed arguments. Known vendor commands are
/// also checked for a well-formed argument count.
pub fn parse_at_command_data(at_string: &str) -> Result<AtCommand, String> {
    // Commands may arrive as AT+<command>, +<command> or <command>.
    let clean = at_string.strip_prefix('+').unwrap_or(at_string);
    let clean = clean.strip_prefix("AT+").unwrap_or(clean);
    if clean.is_empty() {
        return Err("Cannot parse empty AT command".to_string());
    }

    let at_type = parse_at_command_type(clean);
    let (command, arg_string) = match at_type {
        AtCommandType::Execute => (clean, None),
        AtCommandType::Set => split_once(clean, AT_COMMAND_DELIMITER_SET),
        AtCommandType::Query => split_once(clean, AT_COMMAND_DELIMITER_QUERY),
        AtCommandType::Test => split_once(clean, AT_COMMAND_DELIMITER_TEST),
    };
    if command.is_empty() {
        return Err(format!("No command supplied in {}", at_string));
    }

    let vendor = match command {
        AT_COMMAND_VENDOR_XAPL | AT_COMMAND_VENDOR_IPHONEACCEV => {
            Some(AT_COMMAND_VENDOR_APPLE.to_string())
        }
        AT_COMMAND_VENDOR_XEVENT => Some(AT_COMMAND_VENDOR_PLANTRONICS.to_string()),
        _ => None,
    };

    let args: Vec<VendorArg> = match arg_string {
        Some(s) if !s.is_empty() => s.split(AT_COMMAND_ARG_DELIMITER).map(VendorArg::parse).collect(),
        _ => Vec::new(),
    };

    if command == AT_COMMAND_VENDOR_IPHONEACCEV && !args.is_empty() {
        check_iphoneaccev_arg_count(&args)?;
    }

    Ok(AtCommand { raw: at_string.to_string(), at_type, command: command.to_string(), args, vendor })
}

fn split_once<'a>(s: &'a str, delimiter: &str) -> (&'a str, Option<&'a str>) {
    match s.split_once(delimiter) {
        Some((command, args)) => (command, Some(args)),
        None => (s, None),
    }
}

fn parse_at_command_type(command: &str) -> AtCommandType {
    if command.contains(AT_COMMAND_DELIMITER_TEST) {
        AtCommandType::Test
    } else if command.contains(AT_COMMAND_DELIMITER_QUERY) {
        AtCommandType::Query
    } else if command.contains(AT_COMMAND_DELIMITER_SET) {
        AtCommandType::Set
    } else {
        AtCommandType::Execute
    }
}

fn check_iphoneaccev_arg_count(args: &[VendorArg]) -> Result<(), String> {
    let claimed = args
        .first()
        .and_then(VendorArg::as_int)
        .ok_or_else(|| "Expected NumberOfIndicators as first argument".to_string())?;
    if i64::from(claimed) * 2 + 1 != args.len() as i64 {
        return Err(format!(
            "{} indicators were claimed but {} arguments were found",
            claimed,
            args.len()
        ));
    }
    Ok(())
}

/// Battery percentage from `AT+XEVENT=BATTERY,[Level],[NumberOfLevel],[MinutesOfTalk],[IsCharging]`.
pub fn battery_level_from_xevent(args: &[VendorArg]) -> Option<u32> {
    match args.first() {
        Some(VendorArg::Str(name)) if name == XEVENT_BATTERY_LEVEL => (),
        Some(VendorArg::Str(name)) => {
            info!("Skipping non-battery XEVENT: {}", name);
            return None;
        }
        Some(_) => {
            warn!("XEVENT: error parsing event name");
            return None;
        }
        None => {
            warn!("XEVENT: empty arguments");
            return None;
        }
    }

    if args.len() != 5 {
        warn!("XEVENT: wrong battery level event length {}", args.len());
        return None;
    }

    let (level, levels) = match (args[1].as_int(), args[2].as_int()) {
        (Some(level), Some(levels)) => (level, levels),
        _ => {
            warn!("XEVENT: error parsing event values");
            return None;
        }
    };

    if level < 0 || levels <= 0 || level > levels {
        warn!("XEVENT: wrong event value, level={}, levels={}", level, levels);
        return None;
    }

    u32::try_from(i64::from(level) * 100 / i64::from(levels)).ok()
}

/// Battery percentage from `AT+IPHONEACCEV=[NumberOfIndicators],([IndicatorType],[IndicatorValue])*`.
pub fn battery_level_from_iphoneaccev(args: &[VendorArg]) -> Option<u32> {
    let pairs = match args.first() {
        Some(VendorArg::Int(n)) => *n,
        Some(_) => {
            warn!("IPHONEACCEV: error parsing number of indicators");
            return None;
        }
        None => {
            warn!("IPHONEACCEV: empty arguments");
            return None;
        }
    };

    if pairs < 0 || i64::from(pairs) * 2 + 1 != args.len() as i64 {
        warn!("IPHONEACCEV: number of arguments does not match");
        return None;
    }

    let mut value: Option<i32> = None;
    for pair in args[1..].chunks_exact(2) {
        match pair[0].as_int() {
            Some(IPHONEACCEV_BATTERY_LEVEL) => (),
            Some(_) => continue,
            None => {
                warn!("IPHONEACCEV: error parsing indicator type");
                return None;
            }
        }

        match pair[1].as_int() {
            Some(v) => value = Some(v),
            None => {
                warn!("IPHONEACCEV: error parsing indicator value");
                return None;
            }
        }
        break;
    }

    match value {
        Some(v @ 0..=9) => u32::try_from((v + 1) * 10).ok(),
        _ => None,
    }
}

/// Battery percentage carried by a parsed AT command, if it is a battery-bearing SET command.
pub fn battery_level_from_at_command(at_command: &AtCommand) -> Option<u32> {
    battery_level_from_vendor_event(&at_command.command, at_command.at_type, &at_command.args)
}

/// Routes a vendor-specific headset event to its decoder. Only SET commands carry telemetry.
pub fn battery_level_from_vendor_event(
    command: &str,
    at_type: AtCommandType,
    args: &[VendorArg],
) -> Option<u32> {
    if at_type != AtCommandType::Set {
        return None;
    }

    match command {
        AT_COMMAND_VENDOR_XEVENT => battery_level_from_xevent(args),
        AT_COMMAND_VENDOR_IPHONEACCEV => battery_level_from_iphoneaccev(args),
        _ => None,
    }
}

//! Small address-parsing helper shared by the client and server engines.

/// Splits a dial string of the form `"proto!addr!port"` (the reference
/// implementation's bang-separated dial syntax) into its three fields.
pub fn parse_proto(arg: &str) -> Option<(&str, &str, &str)> {
    let mut split = arg.split('!');
    let (proto, addr, port) = (split.next()?, split.next()?, split.next()?);
    Some((proto, addr, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_dial_string() {
        assert_eq!(parse_proto("tcp!localhost!9090"), Some(("tcp", "localhost", "9090")));
    }

    #[test]
    fn rejects_malformed_dial_string() {
        assert_eq!(parse_proto("tcp!localhost"), None);
    }
}

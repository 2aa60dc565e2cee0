use clap::Parser;

/// Orders RPC server
#[derive(Parser, Debug)]
#[command(name = "orders-server")]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Address to listen on, e.g. 0.0.0.0:50051 or :50051
    #[arg(short, long, env = "ORDERS_RPC_ADDR", default_value = "0.0.0.0:50051")]
    pub addr: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_address() {
        let args = Args::try_parse_from(["orders-server"]).unwrap();
        assert_eq!(args.addr, "0.0.0.0:50051");
    }

    #[test]
    fn test_address_flag_is_kept_verbatim() {
        let args = Args::try_parse_from(["orders-server", "--addr", ":7000"]).unwrap();
        assert_eq!(args.addr, ":7000");

        let args = Args::try_parse_from(["orders-server", "-a", "127.0.0.1:0"]).unwrap();
        assert_eq!(args.addr, "127.0.0.1:0");
    }
}

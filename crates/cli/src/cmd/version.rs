use argp::FromArgs;

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Print the mod-connect version.
#[argp(subcommand, name = "version")]
pub struct Args {}

pub fn run(_args: Args) -> u8 {
    println!("mod-connect {}", env!("CARGO_PKG_VERSION"));
    0
}

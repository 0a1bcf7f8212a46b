const RESET: &str = "\x1b[0m";
const BANNER_COLOR: &str = "\x1b[38;5;109m";
const DIM_GRAY: &str = "\x1b[2;90m";
const BANNER: &str = r#"
                                           __
   __  __ ____ ___   _____ ____ _ ____/ /
  / / / // __ `__ \ / ___// __ `// __  /
 / /_/ // / / / / /(__  )/ /_/ // /_/ /
 \__,_//_/ /_/ /_//____/ \__, / \__,_/
                        /____/          "#;
const APP_DESCRIPTION: &str =
    "Ticket-addressed asynchronous message broker for grid agents, over TCP.";
const LIABILITY_NOTICE: &str =
    "Provided \"AS IS\", without warranty of any kind.";

pub fn print_startup_banner() {
    println!("{BANNER_COLOR}");
    println!("{BANNER}{RESET}");
    for line in banner_details() {
        println!("{line}");
    }
    println!("{DIM_GRAY}{LIABILITY_NOTICE}{RESET}");
    println!();
    println!("================================================================");
    println!();
}

fn banner_details() -> Vec<String> {
    vec![
        format!(
            "{} v{} | build {} | rev {}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("XMSGD_BUILD_DATE_UTC"),
            env!("XMSGD_GIT_REVISION")
        ),
        APP_DESCRIPTION.to_owned(),
    ]
}

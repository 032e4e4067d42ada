use gamecore::config::GameConfig;
use serdeconv;
use std::process;

fn main() {
    match serdeconv::to_toml_string(&GameConfig::default()) {
        Ok(config) => println!("{}", config),
        Err(error) => {
            eprintln!("Failed to generate config file: {}", error);
            process::exit(1);
        }
    }
}

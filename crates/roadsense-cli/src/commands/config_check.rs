use crate::config::Config;
use crate::support::print_json;

pub fn run(config: Config, json: bool) {
    if json {
        print_json(&config);
        return;
    }
    match toml::to_string_pretty(&config) {
        Ok(text) => {
            println!("# roadsense resolved configuration");
            print!("{text}");
        }
        Err(e) => {
            eprintln!("error: failed to render config: {e}");
            std::process::exit(1);
        }
    }
}

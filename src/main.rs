use ristretto::jvm::{read_class_file, ClassParser};
use ristretto::program::Program;
use ristretto::runtime::Runtime;

use std::env;
use std::path::Path;
use std::process;

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        let program_name = args.first().map_or("ristretto", String::as_str);
        eprintln!("USAGE: {program_name} <class file>");
        process::exit(1);
    }

    let path = Path::new(&args[1]);
    let class_file_bytes = match read_class_file(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("{}: {err}", path.display());
            process::exit(1);
        }
    };
    let class_file = match ClassParser::parse(&class_file_bytes) {
        Ok(class_file) => class_file,
        Err(err) => {
            eprintln!("{}: {err}", path.display());
            process::exit(1);
        }
    };
    let program = match Program::new(&class_file) {
        Ok(program) => program,
        Err(err) => {
            eprintln!("{}: {err}", path.display());
            process::exit(1);
        }
    };

    let mut runtime = Runtime::new(program);
    if let Err(err) = runtime.run() {
        eprintln!("{}: {err}", path.display());
        process::exit(1);
    }
}

use std::process::exit;

fn main() {
    let mut args = std::env::args();
    let program = args.next().unwrap_or_else(|| "oci-wrapper".into());
    let Some(pipe_base) = args.next() else {
        eprintln!("usage: {program} <named_pipe_base>");
        exit(2);
    };
    match oci::run_wrapper(&pipe_base) {
        Ok(code) => exit(code),
        Err(err) => {
            eprintln!("{program}: {err}");
            exit(1);
        }
    }
}

use nix::unistd::{access, AccessFlags};
use std::path::Path;

/*
    @@@
    @find_program();
    . Returns whether the named program can be executed.
    . A name containing a path separator is tested directly; a bare name is tried
      against every entry of $PATH, split on ':'.
    . Absence is a normal boolean outcome, never an error.
*/
pub fn find_program(program: &str) -> bool {
    if program.is_empty() {
        return false;
    }

    if program.contains('/') {
        return is_executable(Path::new(program));
    }

    let path = std::env::var("PATH").unwrap_or_default();
    for dir in path.split(':') {
        if dir.is_empty() {
            continue;
        }
        if is_executable(&Path::new(dir).join(program)) {
            return true;
        }
    }

    false
}

fn is_executable(path: &Path) -> bool {
    path.is_file() && access(path, AccessFlags::X_OK).is_ok()
}

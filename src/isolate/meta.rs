use crate::core::domain::{Kilobytes, Seconds, Termination, TimeoutKind, Usage};

/// Contents of the file isolate writes with `--meta`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Meta {
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    pub status: Option<String>,
    pub message: Option<String>,
    pub time: Option<Seconds>,
    pub time_wall: Option<Seconds>,
    pub cg_mem: Option<Kilobytes>,
    pub max_rss: Option<Kilobytes>,
    pub oom_killed: bool,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetaError {
    #[error("malformed meta line: {0:?}")]
    Malformed(String),
    #[error("isolate reported an internal error: {0}")]
    Internal(String),
}

pub fn parse(content: &str) -> Result<Meta, MetaError> {
    let mut meta = Meta::default();

    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| MetaError::Malformed(line.to_string()))?;
        let malformed = || MetaError::Malformed(line.to_string());

        match key {
            "exitcode" => meta.exit_code = Some(value.parse().map_err(|_| malformed())?),
            "exitsig" => meta.exit_signal = Some(value.parse().map_err(|_| malformed())?),
            "status" => meta.status = Some(value.to_string()),
            "message" => meta.message = Some(value.to_string()),
            "time" => meta.time = Some(value.parse().map_err(|_| malformed())?),
            "time-wall" => meta.time_wall = Some(value.parse().map_err(|_| malformed())?),
            "cg-mem" => meta.cg_mem = Some(value.parse().map_err(|_| malformed())?),
            "max-rss" => meta.max_rss = Some(value.parse().map_err(|_| malformed())?),
            "cg-oom-killed" => meta.oom_killed = value == "1",
            _ => {}
        }
    }

    Ok(meta)
}

impl Meta {
    pub fn termination(&self) -> Result<Termination, MetaError> {
        match self.status.as_deref() {
            Some("TO") => {
                let wall = self
                    .message
                    .as_deref()
                    .is_some_and(|m| m.contains("wall clock"));
                Ok(Termination::TimedOut(if wall {
                    TimeoutKind::Wall
                } else {
                    TimeoutKind::Cpu
                }))
            }
            Some("SG") => match (self.exit_signal, self.oom_killed) {
                (Some(signal), _) => Ok(Termination::Killed(signal)),
                (None, true) => Ok(Termination::Killed(libc::SIGKILL)),
                (None, false) => Err(MetaError::Malformed(
                    "status:SG without exitsig".to_string(),
                )),
            },
            Some("XX") => Err(MetaError::Internal(
                self.message.clone().unwrap_or_default(),
            )),
            _ => Ok(Termination::Exited(self.exit_code.unwrap_or(0))),
        }
    }

    pub fn usage(&self) -> Usage {
        Usage {
            cpu_time: self.time,
            wall_time: self.time_wall,
            memory: self.cg_mem.or(self.max_rss),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_exit() {
        let meta = parse("time:0.002\ntime-wall:0.010\nmax-rss:1320\ncg-mem:420\nexitcode:0\n")
            .unwrap();

        assert_eq!(meta.termination().unwrap(), Termination::Exited(0));
        assert_eq!(
            meta.usage(),
            Usage {
                cpu_time: Some(0.002),
                wall_time: Some(0.01),
                memory: Some(420),
            }
        );
    }

    #[test]
    fn test_runtime_error() {
        let meta = parse("status:RE\nexitcode:1\nmessage:Exited with error status 1\n").unwrap();

        assert_eq!(meta.termination().unwrap(), Termination::Exited(1));
        assert_eq!(meta.message.as_deref(), Some("Exited with error status 1"));
    }

    #[test]
    fn test_timeouts() {
        let wall = parse("status:TO\nmessage:Time limit exceeded (wall clock)\nkilled:1\n").unwrap();
        let cpu = parse("status:TO\nmessage:Time limit exceeded\nkilled:1\n").unwrap();

        assert_eq!(
            wall.termination().unwrap(),
            Termination::TimedOut(TimeoutKind::Wall)
        );
        assert_eq!(
            cpu.termination().unwrap(),
            Termination::TimedOut(TimeoutKind::Cpu)
        );
    }

    #[test]
    fn test_signal_and_oom() {
        let signalled = parse("status:SG\nexitsig:25\nmessage:Caught fatal signal 25\n").unwrap();
        let oom = parse("status:SG\ncg-oom-killed:1\n").unwrap();

        assert_eq!(signalled.termination().unwrap(), Termination::Killed(25));
        assert_eq!(oom.termination().unwrap(), Termination::Killed(9));
    }

    #[test]
    fn test_signal_without_number_is_malformed() {
        let meta = parse("status:SG\nmessage:Caught fatal signal\n").unwrap();

        assert!(matches!(meta.termination(), Err(MetaError::Malformed(_))));
    }

    #[test]
    fn test_internal_error_and_garbage() {
        let internal = parse("status:XX\nmessage:Cannot run proxy\n").unwrap();
        assert_eq!(
            internal.termination().unwrap_err(),
            MetaError::Internal("Cannot run proxy".to_string())
        );

        assert!(matches!(
            parse("exitcode:abc"),
            Err(MetaError::Malformed(_))
        ));
        assert!(matches!(parse("nocolon"), Err(MetaError::Malformed(_))));
    }
}

use std::{fmt::Display, marker::PhantomData};

use clap::{
    builder::{EnumValueParser, PossibleValue, TypedValueParser, ValueParserFactory},
    ValueEnum,
};

/// How many workers to start: a named CPU count or an explicit number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ThreadsConfig {
    Named(NamedThreadConfig),
    Num(u64),
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        ThreadsConfig::Named(NamedThreadConfig::Cpu)
    }
}

impl ThreadsConfig {
    pub fn get_num_threads(self) -> usize {
        match self {
            ThreadsConfig::Named(NamedThreadConfig::Cpu) => num_cpus::get(),
            ThreadsConfig::Named(NamedThreadConfig::Physical) => num_cpus::get_physical(),
            ThreadsConfig::Num(n) => n as usize,
        }
    }
}

impl Display for ThreadsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreadsConfig::Named(NamedThreadConfig::Cpu) => f.write_str("cpu"),
            ThreadsConfig::Named(NamedThreadConfig::Physical) => f.write_str("physical"),
            ThreadsConfig::Num(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(ValueEnum)]
pub enum NamedThreadConfig {
    /// Use the number of logical CPUs available.
    Cpu,
    /// Use the number of physical CPUs available.
    Physical,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadsConfigParser(PhantomData<ThreadsConfig>);

impl ValueParserFactory for ThreadsConfig {
    type Parser = ThreadsConfigParser;

    fn value_parser() -> Self::Parser {
        ThreadsConfigParser::default()
    }
}

impl TypedValueParser for ThreadsConfigParser {
    type Value = ThreadsConfig;

    fn parse_ref(
        &self,
        cmd: &clap::Command,
        arg: Option<&clap::Arg>,
        value: &std::ffi::OsStr,
    ) -> Result<Self::Value, clap::Error> {
        let named = EnumValueParser::<NamedThreadConfig>::new().parse_ref(cmd, arg, value);
        match named {
            Ok(named) => Ok(ThreadsConfig::Named(named)),
            Err(enum_error) => match clap::value_parser!(u64).range(1..).parse_ref(cmd, arg, value) {
                Ok(n) => Ok(ThreadsConfig::Num(n)),
                Err(num_error) => Err(clap::Error::raw(
                    clap::error::ErrorKind::InvalidValue,
                    format!("Invalid worker count: not a named config ({enum_error}) or a number ({num_error})"),
                )
                .with_cmd(cmd)),
            },
        }
    }

    fn possible_values(&self) -> Option<Box<dyn Iterator<Item = PossibleValue> + '_>> {
        let named = EnumValueParser::<NamedThreadConfig>::new()
            .possible_values()?
            .collect::<Vec<_>>();
        let it = named
            .into_iter()
            .chain(std::iter::once(PossibleValue::new("<number>").help("A specific number of workers")));
        Some(Box::new(it))
    }
}

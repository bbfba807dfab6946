/// Declare the operator kinds, named after the caffe2 operator they load
/// from.
macro_rules! op_kinds {
    ($($kind:ident),* $(,)?) => {
        /// Closed set of operator kinds. Unknown caffe2 operators load as
        /// `Unsupported` and fail when a net is instantiated.
        #[derive(Clone, Debug, PartialEq, Eq, Hash)]
        pub enum OpKind {
            $($kind,)*
            Unsupported(String),
        }

        impl OpKind {
            pub fn from_name(name: &str) -> OpKind {
                match name {
                    $(stringify!($kind) => OpKind::$kind,)*
                    other => OpKind::Unsupported(other.to_string()),
                }
            }

            pub fn as_str(&self) -> &str {
                match self {
                    $(OpKind::$kind => stringify!($kind),)*
                    OpKind::Unsupported(name) => name,
                }
            }
        }
    };
}

macro_rules! args_1 {
    ($inputs:expr) => {{
        if $inputs.len() != 1 {
            anyhow::bail!("Expected 1 arg, got {}", $inputs.len())
        }
        $inputs[0]
    }};
}

macro_rules! args_2 {
    ($inputs:expr) => {{
        if $inputs.len() != 2 {
            anyhow::bail!("Expected 2 args, got {}", $inputs.len())
        }
        ($inputs[0], $inputs[1])
    }};
}

macro_rules! args_3 {
    ($inputs:expr) => {{
        if $inputs.len() != 3 {
            anyhow::bail!("Expected 3 args, got {}", $inputs.len())
        }
        ($inputs[0], $inputs[1], $inputs[2])
    }};
}

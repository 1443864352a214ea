// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// Defines the message type newtype, with an associated constant for each
/// control message.
macro_rules! vmbus_message_type {
    (pub enum $enum_name:ident, $type_name:ident { $( $num:literal $name:ident $rest:tt, )* }) => {
        /// The value in the message header that identifies a vmbus control
        /// message. Values outside the known set are kept so they can be
        /// reported back in errors.
        #[repr(transparent)]
        #[derive(Copy, Clone, PartialEq, Eq, Hash, IntoBytes, FromBytes, Immutable, KnownLayout)]
        pub struct $type_name(pub u32);

        impl $type_name {
            $(pub const $name: Self = Self($num);)*

            /// Returns the protocol name of this message type, if it is known.
            pub fn name(&self) -> Option<&'static str> {
                match *self {
                    $(Self::$name => Some(stringify!($name)),)*
                    _ => None,
                }
            }
        }

        impl std::fmt::Debug for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self.name() {
                    Some(name) => f.pad(name),
                    None => write!(f, "{:#x}", self.0),
                }
            }
        }
    }
}

/// Defines an enum with a variant per message struct, and the `parse` method
/// that selects the variant allowed by the negotiated version and features.
macro_rules! vmbus_message_enum {
    (pub enum $enum_name:ident, $type_name:ident { $( $num:literal $name:ident { $($type:ident $min_version:tt $($condition_name:ident:$condition_value:tt)*),* } ,)* }) => {
        /// A parsed vmbus control message. The trailing slice holds any bytes
        /// past the selected struct; they are never interpreted.
        #[derive(Debug)]
        pub enum $enum_name<'a> {
            $( $($type($type, &'a [u8]),)* )*
        }

        impl<'a> $enum_name<'a> {
            /// Parses a control message, accepting only the messages (and
            /// message variants) defined by `version`.
            ///
            /// Pass `None` before a version has been negotiated; only the
            /// contact messages parse in that state.
            pub fn parse(data: &'a [u8], version: Option<VersionInfo>) -> Result<Self, ParseError> {
                let (version, features) = match version {
                    Some(version) => (Some(version.version), version.feature_flags),
                    None => (None, FeatureFlags::new()),
                };

                let (header, data) = MessageHeader::read_from_prefix(data)
                    .map_err(|_| ParseError::MessageTooSmall(None))?;

                let message = match header.message_type {
                    $(
                        $($type_name::$name
                            if vmbus_message_enum!(@create_conditions $type version features data $min_version $($condition_name:$condition_value)*) =>
                        {
                            let (message, remaining) = $type::read_from_prefix(data)
                                .map_err(|_| ParseError::MessageTooSmall(Some(header.message_type)))?;

                            Self::$type(message, remaining)
                        })*
                    )*
                    _ => return Err(ParseError::InvalidMessageType(header.message_type)),
                };

                Ok(message)
            }

            /// The message type of the parsed message.
            pub fn message_type(&self) -> $type_name {
                match self {
                    $( $(Self::$type(..) => $type_name::$name,)* )*
                }
            }
        }
    };

    (@create_conditions $type:ident $version_ident:ident $features_ident:ident $data_ident:ident $min_version:tt $($name:ident:$value:tt)*) => {
        $version_ident >= vmbus_message_enum!(@to_version $min_version)
        $(&& vmbus_message_enum!(@create_condition $type $features_ident $data_ident $name $value))*
    };

    (@create_condition $type:ident $features_ident:ident $data_ident:ident features $min_features:tt) => {
       vmbus_message_enum!(@to_features $features_ident $min_features)
    };

    (@create_condition $type:ident $features_ident:ident $data_ident:ident check_size true) => {
        $data_ident.len() >= size_of::<$type>()
    };

    (@to_version 0) => { None };
    (@to_version $version:ident) => { Some(Version::$version) };

    (@to_features $features_ident:ident $flag:ident) => { $features_ident.$flag() };
    (@to_features $features_ident:ident ($flag1:ident | $flag2:ident)) => { ($features_ident.$flag1() || $features_ident.$flag2()) };
}

/// Implements `VmbusMessage` for each message struct and asserts at compile
/// time that every message fits in a hypervisor message payload.
macro_rules! vmbus_message_trait_impl {
    (pub enum $enum_name:ident, $type_name:ident { $( $num:literal $name:ident { $($type:ident $min_version:tt $($condition_name:ident:$condition_value:tt)*),* } ,)* }) => {
        $($(
            impl VmbusMessage for $type {
                const MESSAGE_TYPE: $type_name = $type_name::$name;
            }

            static_assertions::const_assert!($type::MESSAGE_SIZE <= MAX_MESSAGE_SIZE);
        )*)*
    }
}

/// Generates `MessageType`, `Message` and the `VmbusMessage` impls from one
/// table. See its use in protocol.rs for the table syntax.
macro_rules! vmbus_messages {
    ($($contents:tt)*) => {
        vmbus_message_type!($($contents)*);
        vmbus_message_enum!($($contents)*);
        vmbus_message_trait_impl!($($contents)*);
    }
}

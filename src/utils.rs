use std::fmt::Display;

macro_rules! derive_from_enum {
    (impl $(< $( $lt:tt $( : $clt:tt $(+ $dlt:tt )* )? ),+ >)? for $variant: ty, $variant_path: path, $enum: ty) => {
        impl $(< $( $lt $( : $clt $(+ $dlt )* )? ),+ >)? From<$variant> for $enum {
            fn from(x: $variant) -> Self {
                $variant_path(x)
            }
        }
    };
}

macro_rules! derive_try_from_variant {
    (impl $(< $( $lt:tt $( : $clt:tt $(+ $dlt:tt )* )? ),+ >)? for $variant: ty, $variant_path: path, $enum: ty) => {
        impl $(< $( $lt $( : $clt $(+ $dlt )* )? ),+ >)? TryFrom<$enum> for $variant {
            type Error = $enum;

            fn try_from(data: $enum) -> Result<Self, Self::Error> {
                if let $variant_path(x) = data {
                    Ok(x)
                } else {
                    Err(data)
                }
            }
        }
    };
}

macro_rules! derive_impls_for_enum_variants {
    (impl $(< $( $lt:tt $( : $clt:tt $(+ $dlt:tt )* )? ),+ >)? for $variant:ty, $variant_path:path, $enum:ty) => {
        derive_from_enum!(impl $(< $( $lt $( : $clt $(+ $dlt )* )? ),+ >)? for $variant, $variant_path, $enum);
        derive_try_from_variant!(impl $(< $( $lt $( : $clt $(+ $dlt )* )? ),+ >)? for $variant, $variant_path, $enum);
    };
}

/// Derive display to match the type's name
macro_rules! derive_display_as_type_name {
    ( $name:ident $(< $( $lt:tt $( : $clt:tt $(+ $dlt:tt )* )? ),+ >)? ) => {
        impl $(< $( $lt $( : $clt $(+ $dlt )* )? ),+ >)? std::fmt::Display for $name $(< $( $lt ),+ >)?
        {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, stringify!($name))
            }
        }
    }
}

/// Join an iterator of displayable items for logging
pub fn format_iterator<It: IntoIterator>(iter: It) -> String
where
	It::Item: Display,
{
	use itertools::Itertools;
	iter.into_iter().join(", ")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn format_iterator_joins_with_commas() {
		assert_eq!(format_iterator([1, 2, 3]), "1, 2, 3");
		assert_eq!(format_iterator(Vec::<u32>::new()), "");
	}
}

//! Names the generated code calls through the `__helpers` global.
//!
//! The compiler never inlines what these do; the embedding runtime supplies
//! a table with one callable per name.

/// Global under which the helper table is looked up.
pub const HELPERS_GLOBAL: &str = "__helpers";

macro_rules! helpers {
    ($($variant:ident => $name:literal,)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Helper {
            $($variant,)*
        }

        impl Helper {
            pub const ALL: &'static [Helper] = &[$(Helper::$variant,)*];

            pub fn name(self) -> &'static str {
                match self {
                    $(Helper::$variant => $name,)*
                }
            }

            pub fn from_name(name: &str) -> Option<Helper> {
                match name {
                    $($name => Some(Helper::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

helpers! {
    ValidateDeclarative => "validate_declarative",
    ValidateTemplate => "validate_template",
    ValidateConst => "validate_const",
    MakeObjectNode => "make_object_node",
    MakeChildNode => "make_child_node",
    MakeTemplateNode => "make_template_node",
    MakeTemplateInstNode => "make_template_inst_node",
    MakeTemplateScope => "make_template_scope",
    AddStorage => "add_storage",
    AddAlias => "add_alias",
    AddDeclFunction => "add_decl_function",
    RunOperator => "run_operator",
    RunChainedOperator => "run_chained_operator",
    RunTemplateOperator => "run_template_operator",
    RemapError => "remap_error",
}

impl std::fmt::Display for Helper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for helper in Helper::ALL {
            assert_eq!(Helper::from_name(helper.name()), Some(*helper));
        }
        assert_eq!(Helper::from_name("make_node"), None);
        assert_eq!(Helper::RunOperator.to_string(), "run_operator");
    }
}

pub mod param_value;
pub mod parameter;
pub mod types;

pub use param_value::ParamValue;
pub use parameter::{
    bind_parameters, get_output_parameter, Param, ParamDirection, Parameter, ParameterBinding,
    ParameterList, NULL_DATA,
};
pub use types::{sql_type, CType};

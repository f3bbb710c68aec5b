use capctl_source::chanlist::parse_named;
use capctl_source::ChannelListStore;

use crate::cmd::ChannelsArgs;
use crate::exit::{source_error, CliResult, SUCCESS};
use crate::output::{print_channel_lists, OutputFormat};

pub fn run(args: ChannelsArgs, format: OutputFormat) -> CliResult<i32> {
    let mut store =
        ChannelListStore::with_defaults().map_err(|err| source_error("default channel lists", err))?;
    for definition in &args.channel_lists {
        let (name, entries) =
            parse_named(definition).map_err(|err| source_error("channel list", err))?;
        store
            .define(&name, entries)
            .map_err(|err| source_error("channel list", err))?;
    }
    print_channel_lists(store.iter().map(|list| list.as_ref()), format);
    Ok(SUCCESS)
}
